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


use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod handlers;

pub use handlers::deployments::FALLBACK_BODY;

use crate::kubemirror::controller::lister::DeploymentLister;
use crate::kubemirror::logger::{log_debug, log_info};
use crate::kubemirror::observability::tracing;
use crate::kubemirror::util::error::{with_context, BoxError};

/// Response header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub(crate) struct AppState {
    lister: Arc<dyn DeploymentLister>,
}

/// Query surface: `/deployments` for any method, everything else falls back
/// to a fixed greeting.
pub fn build_router(lister: Arc<dyn DeploymentLister>) -> Router {
    Router::new()
        .route("/deployments", any(handlers::deployments::list))
        .fallback(handlers::deployments::fallback)
        .layer(middleware::from_fn(assign_request_id))
        .with_state(AppState { lister })
}

/// Operational endpoints, served on their own port.
pub fn build_metrics_router(lister: Arc<dyn DeploymentLister>) -> Router {
    Router::new()
        .route("/metrics", get(handlers::observability::metrics))
        .route("/healthz", get(handlers::observability::readiness))
        .route("/readyz", get(handlers::observability::readiness))
        .route("/livez", get(handlers::observability::liveness))
        .layer(middleware::from_fn(assign_request_id))
        .with_state(AppState { lister })
}

/// Tags the request with a fresh UUIDv4. Log lines emitted while serving it
/// carry the id, and the response echoes it in `X-Request-ID`.
async fn assign_request_id(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let mut response = tracing::with_request("server", request_id.clone(), async move {
        log_debug(
            "server",
            "Handling request",
            &[("method", method.as_str()), ("path", path.as_str())],
        );
        next.run(request).await
    })
    .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, BoxError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind server listener at {addr}")))
}

/// Serves `router` on `listener` until `cancel` fires, then drains
/// in-flight requests.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    let addr = listener
        .local_addr()
        .map_err(|e| with_context(e, "Failed to read listener address"))?;
    let addr_text = addr.to_string();
    log_info(
        "server",
        "HTTP server listening",
        &[("server", name), ("addr", addr_text.as_str())],
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| with_context(e, format!("{name} server failed on {addr}")))?;

    log_info("server", "HTTP server stopped", &[("server", name)]);
    Ok(())
}
