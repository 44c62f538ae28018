use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use kubemirror::kubemirror::api::client::{ClientError, ResourceClient, VersionToken, WatchEvent};
use kubemirror::kubemirror::api::kube::{ConnectionConfig, KubeClient};
use kubemirror::kubemirror::k8s::store::ResourceKey;
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Default)]
struct Recorded {
    queries: Vec<HashMap<String, String>>,
    authorization: Vec<String>,
    deleted: Vec<String>,
}

type Shared = Arc<Mutex<Recorded>>;

fn deployment_json(name: &str, resource_version: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": "apps",
            "resourceVersion": resource_version,
        },
        "spec": { "replicas": 2 },
    })
}

fn record(state: &Shared, headers: &HeaderMap, query: &HashMap<String, String>) {
    let mut recorded = state.lock().expect("recorded");
    recorded.queries.push(query.clone());
    if let Some(value) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        recorded.authorization.push(value.to_string());
    }
}

async fn collection(
    State(state): State<Shared>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    record(&state, &headers, &query);
    assert_eq!(namespace, "apps");

    if query.get("watch").map(String::as_str) == Some("true") {
        if query.get("resourceVersion").map(String::as_str) == Some("1") {
            return (
                StatusCode::GONE,
                Json(json!({"kind": "Status", "code": 410, "message": "too old resource version: 1"})),
            )
                .into_response();
        }
        let added = json!({"type": "ADDED", "object": deployment_json("gamma", "11")});
        let bookmark = json!({
            "type": "BOOKMARK",
            "object": {"kind": "Deployment", "metadata": {"resourceVersion": "12"}},
        });
        return (StatusCode::OK, format!("{added}\n{bookmark}\n")).into_response();
    }

    let page = match query.get("continue").map(String::as_str) {
        None => json!({
            "apiVersion": "apps/v1",
            "kind": "DeploymentList",
            "metadata": {"resourceVersion": "10", "continue": "page-2"},
            "items": [deployment_json("alpha", "7")],
        }),
        Some("page-2") => json!({
            "apiVersion": "apps/v1",
            "kind": "DeploymentList",
            "metadata": {"resourceVersion": "10"},
            "items": [deployment_json("beta", "9")],
        }),
        Some(other) => {
            return (StatusCode::BAD_REQUEST, format!("unknown continue token {other}"))
                .into_response()
        }
    };
    Json(page).into_response()
}

async fn object(
    State(state): State<Shared>,
    Path((_namespace, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    record(&state, &headers, &HashMap::new());
    match name.as_str() {
        "alpha" => Json(deployment_json("alpha", "7")).into_response(),
        "flaky" => (StatusCode::SERVICE_UNAVAILABLE, "etcd leader changed").into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({"kind": "Status", "code": 404, "reason": "NotFound"})),
        )
            .into_response(),
    }
}

async fn remove(
    State(state): State<Shared>,
    Path((_namespace, name)): Path<(String, String)>,
) -> Response {
    if name == "alpha" {
        state.lock().expect("recorded").deleted.push(name);
        Json(json!({"kind": "Status", "status": "Success"})).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn fake_api_server() -> (SocketAddr, Shared) {
    let state: Shared = Arc::new(Mutex::new(Recorded::default()));
    let router = Router::new()
        .route("/apis/apps/v1/namespaces/{namespace}/deployments", get(collection))
        .route(
            "/apis/apps/v1/namespaces/{namespace}/deployments/{name}",
            get(object).delete(remove),
        )
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("fake api server");
    });
    (addr, state)
}

fn client_for(addr: SocketAddr, token: Option<&str>) -> KubeClient {
    let config = ConnectionConfig {
        server: format!("http://{addr}"),
        token: token.map(str::to_string),
        ..ConnectionConfig::default()
    };
    KubeClient::from_config(config, "apps").expect("client")
}

#[tokio::test]
async fn list_follows_continue_tokens() {
    let (addr, state) = fake_api_server().await;
    let client = client_for(addr, None);

    let listing = client.list().await.expect("list");

    let names: Vec<&str> = listing.items.iter().map(|record| record.name()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert_eq!(listing.version, VersionToken::new("10"));

    let recorded = state.lock().expect("recorded");
    assert_eq!(recorded.queries.len(), 2);
    assert_eq!(recorded.queries[0].get("limit").map(String::as_str), Some("500"));
    assert_eq!(
        recorded.queries[1].get("continue").map(String::as_str),
        Some("page-2")
    );
    assert!(recorded.authorization.is_empty());
}

#[tokio::test]
async fn watch_streams_events_from_the_cursor() {
    let (addr, state) = fake_api_server().await;
    let client = client_for(addr, Some("secret-token"));

    let events: Vec<_> = client
        .watch(&VersionToken::new("10"))
        .await
        .expect("watch")
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    match &events[0] {
        Ok(WatchEvent::Added(record)) => {
            assert_eq!(record.name(), "gamma");
            assert_eq!(record.resource_version(), Some("11"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(
        events[1].as_ref().ok(),
        Some(&WatchEvent::Bookmark(VersionToken::new("12")))
    );

    let recorded = state.lock().expect("recorded");
    let query = &recorded.queries[0];
    assert_eq!(query.get("watch").map(String::as_str), Some("true"));
    assert_eq!(query.get("resourceVersion").map(String::as_str), Some("10"));
    assert_eq!(query.get("allowWatchBookmarks").map(String::as_str), Some("true"));
    assert_eq!(recorded.authorization, vec!["Bearer secret-token"]);
}

#[tokio::test]
async fn gone_watch_cursor_is_reported_as_expired() {
    let (addr, _) = fake_api_server().await;
    let client = client_for(addr, None);

    match client.watch(&VersionToken::new("1")).await {
        Err(err) => assert!(err.is_expired(), "{err}"),
        Ok(_) => panic!("expected an expired cursor"),
    }
}

#[tokio::test]
async fn get_maps_status_codes() {
    let (addr, _) = fake_api_server().await;
    let client = client_for(addr, None);

    let alpha = client
        .get(&ResourceKey::new("apps", "alpha"))
        .await
        .expect("alpha");
    assert_eq!(alpha.spec.replicas, Some(2));

    let missing = client
        .get(&ResourceKey::new("apps", "missing"))
        .await
        .expect_err("missing");
    assert_eq!(missing, ClientError::NotFound(ResourceKey::new("apps", "missing")));

    let flaky = client
        .get(&ResourceKey::new("apps", "flaky"))
        .await
        .expect_err("flaky");
    assert!(flaky.is_transient(), "{flaky}");
}

#[tokio::test]
async fn delete_reports_missing_objects() {
    let (addr, state) = fake_api_server().await;
    let client = client_for(addr, None);

    client
        .delete(&ResourceKey::new("apps", "alpha"))
        .await
        .expect("delete alpha");
    let err = client
        .delete(&ResourceKey::new("apps", "ghost"))
        .await
        .expect_err("delete ghost");
    assert!(err.is_not_found());
    assert_eq!(state.lock().expect("recorded").deleted, vec!["alpha"]);
}

#[tokio::test]
async fn kubeconfig_token_is_sent_as_bearer() {
    let (addr, state) = fake_api_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config");
    fs::write(
        &path,
        format!(
            "apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: local
  cluster:
    server: http://{addr}
    insecure-skip-tls-verify: true
users:
- name: admin
  user:
    token: from-kubeconfig
contexts:
- name: dev
  context:
    cluster: local
    user: admin
"
        ),
    )
    .expect("write kubeconfig");

    let config = ConnectionConfig::from_kubeconfig(Some(path.as_path())).expect("kubeconfig");
    assert!(config.insecure_skip_tls_verify);
    let client = KubeClient::from_config(config, "apps").expect("client");
    client.list().await.expect("list");

    let recorded = state.lock().expect("recorded");
    assert!(recorded
        .authorization
        .iter()
        .all(|value| value == "Bearer from-kubeconfig"));
    assert_eq!(recorded.authorization.len(), 2);
}

#[tokio::test]
async fn unreachable_server_is_a_transient_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = client_for(addr, None).list().await.expect_err("refused");
    assert!(matches!(err, ClientError::Transport(_)), "{err}");
    assert!(err.is_transient());
}
