/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Task-local correlation context. Spans are backed by the `tracing` crate,
//! and a [`TraceContext`] rides along so the logger can attach `trace_id`,
//! `span_id` and, while serving an HTTP request, `request_id` to every line.

use rand::{rngs::OsRng, RngCore};
use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
    request_id: Option<Arc<str>>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

task_local! {
    static ACTIVE_TRACE: TraceContext;
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber exactly once.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let subscriber = Registry::default();
        // Another component may already have installed one.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Returns the currently active [`TraceContext`], if any.
pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.try_with(|ctx| ctx.clone()).ok()
}

/// Execute `fut` inside a new span. The trace id and request id of an
/// enclosing context are inherited.
pub async fn with_span<T>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let request_id = current_context().and_then(|ctx| ctx.request_id);
    enter(component, span_name.into(), request_id, fut).await
}

/// Execute `fut` on behalf of a single request identified by `request_id`.
pub async fn with_request<T>(
    component: &'static str,
    request_id: impl Into<String>,
    fut: impl Future<Output = T>,
) -> T {
    let request_id: Arc<str> = Arc::from(request_id.into());
    enter(component, "request".to_string(), Some(request_id), fut).await
}

async fn enter<T>(
    component: &'static str,
    name: String,
    request_id: Option<Arc<str>>,
    fut: impl Future<Output = T>,
) -> T {
    let trace_id = current_context()
        .map(|ctx| ctx.trace_id)
        .unwrap_or_else(|| Arc::<str>::from(random_hex(16)));
    let span_id = Arc::<str>::from(random_hex(8));
    let span = tracing::info_span!(
        "kubemirror",
        component = component,
        span = name.as_str(),
        trace_id = trace_id.as_ref(),
        span_id = span_id.as_ref(),
        request_id = request_id.as_deref().unwrap_or_default(),
    );
    let context = TraceContext {
        trace_id,
        span_id,
        request_id,
    };

    ACTIVE_TRACE.scope(context, fut.instrument(span)).await
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(bytes * 2);
    for byte in data {
        let _ = write!(&mut output, "{:02x}", byte);
    }
    output
}
