use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use kubemirror::kubemirror::controller::lister::DeploymentLister;
use kubemirror::kubemirror::controller::watch::{WatchCache, WatchCacheConfig};
use kubemirror::kubemirror::observability::metrics::RelistReason;
use kubemirror::kubemirror::server::{self, FALLBACK_BODY, REQUEST_ID_HEADER};
use kubemirror::kubemirror::test_support::{deployment, deployment_in, FakeResourceClient};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

fn unsynced_cache(client: Arc<FakeResourceClient>) -> Arc<WatchCache> {
    Arc::new(WatchCache::new(client, WatchCacheConfig::default()))
}

async fn get(lister: Arc<dyn DeploymentLister>, path: &str) -> (StatusCode, String, String, Vec<u8>) {
    let response = server::build_router(lister)
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .expect("response");
    let status = response.status();
    let request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec();
    (status, request_id, content_type, body)
}

#[tokio::test]
async fn deployments_is_empty_array_before_sync() {
    let cache = unsynced_cache(Arc::new(FakeResourceClient::new()));

    let (status, request_id, content_type, body) = get(cache, "/deployments").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "application/json");
    assert_eq!(body, b"[]");
    assert!(Uuid::parse_str(&request_id).is_ok(), "{request_id}");
}

#[tokio::test]
async fn deployments_lists_sorted_names_after_sync() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![
        deployment("web", "3"),
        deployment("api", "1"),
        deployment_in("default", "cache", "2"),
    ]);
    let cache = unsynced_cache(client);
    cache.relist(RelistReason::Initial).await.expect("relist");

    let (status, _, _, body) = get(cache, "/deployments").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, br#"["api","cache","web"]"#);
}

#[tokio::test]
async fn unknown_paths_get_the_fixed_greeting() {
    let cache = unsynced_cache(Arc::new(FakeResourceClient::new()));

    for path in ["/", "/healthz", "/deployments/web", "/anything/else?x=1"] {
        let (status, request_id, _, body) = get(cache.clone(), path).await;
        assert_eq!(status, StatusCode::OK, "{path}");
        assert_eq!(body, FALLBACK_BODY.as_bytes(), "{path}");
        assert!(!request_id.is_empty(), "{path}");
    }
}

#[tokio::test]
async fn every_response_carries_a_distinct_request_id() {
    let cache = unsynced_cache(Arc::new(FakeResourceClient::new()));
    let mut ids = HashSet::new();
    for _ in 0..5 {
        let (_, request_id, _, _) = get(cache.clone(), "/deployments").await;
        let parsed = Uuid::parse_str(&request_id).expect("uuid");
        assert_eq!(parsed.get_version_num(), 4);
        ids.insert(request_id);
    }
    assert_eq!(ids.len(), 5);
}

#[tokio::test]
async fn served_over_tcp_until_cancelled() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1"), deployment("y", "2")]);
    let cache = unsynced_cache(client);
    cache.relist(RelistReason::Initial).await.expect("relist");

    let listener = server::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let cancel = CancellationToken::new();
    let task = tokio::spawn(server::serve(
        "query",
        listener,
        server::build_router(cache),
        cancel.clone(),
    ));

    let response = reqwest::get(format!("http://{addr}/deployments"))
        .await
        .expect("request");
    assert!(response.headers().contains_key("x-request-id"));
    let names: Vec<String> = response.json().await.expect("json");
    assert_eq!(names, vec!["x", "y"]);

    let greeting = reqwest::get(format!("http://{addr}/"))
        .await
        .expect("request")
        .text()
        .await
        .expect("text");
    assert_eq!(greeting, FALLBACK_BODY);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server stopped")
        .expect("join");
    assert!(result.is_ok());
}
