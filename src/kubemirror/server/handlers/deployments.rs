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


use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::kubemirror::logger::log_debug;
use crate::kubemirror::observability::metrics;
use crate::kubemirror::server::AppState;

/// Body served for every path other than `/deployments`.
pub const FALLBACK_BODY: &str = "Hello from FastHTTP!";

/// Sorted Deployment names as a compact JSON array. Never waits for the
/// cache: before the initial sync this is usually `[]`.
pub(in crate::kubemirror::server) async fn list(State(state): State<AppState>) -> Response {
    metrics::record_http_request("/deployments");
    let names = state.lister.list_names();
    let count = names.len().to_string();
    log_debug(
        "server",
        "Listing deployments",
        &[
            ("count", count.as_str()),
            ("synced", if state.lister.has_synced() { "true" } else { "false" }),
        ],
    );
    Json(names).into_response()
}

pub(in crate::kubemirror::server) async fn fallback() -> Response {
    metrics::record_http_request("fallback");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        FALLBACK_BODY,
    )
        .into_response()
}
