use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubemirror::kubemirror::api::client::{ClientError, ResourceClient};
use kubemirror::kubemirror::controller::lister::DeploymentLister;
use kubemirror::kubemirror::controller::manager::{ControllerManager, ManagerConfig};
use kubemirror::kubemirror::controller::queue::QueueConfig;
use kubemirror::kubemirror::controller::reconcile::{reconcile_fn, ReconcileAction, Reconciler};
use kubemirror::kubemirror::controller::watch::WatchCacheConfig;
use kubemirror::kubemirror::k8s::store::ResourceKey;
use kubemirror::kubemirror::test_support::{deployment, FakeResourceClient};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn config(resync_period: Duration) -> ManagerConfig {
    ManagerConfig {
        workers: 2,
        resync_period,
        watch: WatchCacheConfig {
            relist_period: Duration::from_secs(300),
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        },
        queue: QueueConfig::default(),
    }
}

fn recording_reconciler(
    seen: Arc<Mutex<Vec<String>>>,
) -> Arc<impl Reconciler<Error = io::Error> + 'static> {
    Arc::new(reconcile_fn("Deployment", move |key: ResourceKey| {
        let seen = seen.clone();
        async move {
            seen.lock().expect("seen").push(key.name.clone());
            Ok::<_, io::Error>(ReconcileAction::Done)
        }
    }))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn count(seen: &Arc<Mutex<Vec<String>>>, name: &str) -> usize {
    seen.lock()
        .expect("seen")
        .iter()
        .filter(|entry| entry.as_str() == name)
        .count()
}

#[tokio::test]
async fn listed_and_watched_keys_are_reconciled() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1"), deployment("y", "2")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let manager = Arc::new(ControllerManager::new(
        client.clone(),
        recording_reconciler(seen.clone()),
        config(Duration::ZERO),
    ));

    let cancel = CancellationToken::new();
    let task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    eventually("x and y reconciled", || {
        count(&seen, "x") >= 1 && count(&seen, "y") >= 1
    })
    .await;

    client.wait_for_watches(1).await;
    client.create(&deployment("z", "")).await.expect("create z");
    eventually("z reconciled", || count(&seen, "z") >= 1).await;
    assert_eq!(manager.cache().len(), 3);

    cancel.cancel();
    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("manager stopped")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn deleted_key_leaves_the_listing_and_is_reconciled() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1"), deployment("y", "2")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let reconciler = {
        let seen = seen.clone();
        Arc::new(reconcile_fn("Deployment", move |key: ResourceKey| {
            let seen = seen.clone();
            async move {
                seen.lock().expect("seen").push(key.to_string());
                Ok::<_, io::Error>(ReconcileAction::Done)
            }
        }))
    };
    let manager = Arc::new(ControllerManager::new(
        client.clone(),
        reconciler,
        config(Duration::ZERO),
    ));

    let cancel = CancellationToken::new();
    let task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    eventually("initial keys reconciled", || seen.lock().expect("seen").len() >= 2).await;
    assert_eq!(manager.cache().list_names(), vec!["x", "y"]);
    client.wait_for_watches(1).await;
    seen.lock().expect("seen").clear();

    client
        .delete(&ResourceKey::new("default", "x"))
        .await
        .expect("delete x");

    eventually("x reconciled after delete", || {
        seen.lock().expect("seen").iter().any(|key| key == "default/x")
    })
    .await;
    assert_eq!(manager.cache().list_names(), vec!["y"]);
    assert_eq!(*seen.lock().expect("seen"), vec!["default/x"]);

    cancel.cancel();
    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("manager stopped")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn periodic_resync_reenqueues_cached_keys() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let manager = Arc::new(ControllerManager::new(
        client.clone(),
        recording_reconciler(seen.clone()),
        config(Duration::from_millis(30)),
    ));

    let cancel = CancellationToken::new();
    let task = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    eventually("resync passes", || count(&seen, "x") >= 3).await;
    assert_eq!(client.list_calls(), 1, "resync must not relist");

    cancel.cancel();
    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("manager stopped")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn fatal_list_error_stops_the_manager() {
    let client = Arc::new(FakeResourceClient::new());
    client.fail_next_list(ClientError::Status {
        code: 403,
        message: "deployments.apps is forbidden".into(),
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let manager = ControllerManager::new(
        client.clone(),
        recording_reconciler(seen.clone()),
        config(Duration::from_millis(30)),
    );

    let result = timeout(Duration::from_secs(5), manager.run(CancellationToken::new()))
        .await
        .expect("manager returned");
    let err = result.expect_err("forbidden list is fatal");
    assert!(err.to_string().contains("forbidden"));
    assert!(seen.lock().expect("seen").is_empty());
    assert!(!manager.cache().has_synced());
}

#[tokio::test]
async fn cancellation_before_sync_returns_cleanly() {
    let client = Arc::new(FakeResourceClient::new());
    client.fail_next_list(ClientError::Transport("connection refused".into()));
    client.fail_next_list(ClientError::Transport("connection refused".into()));
    let manager = ControllerManager::new(
        client.clone(),
        recording_reconciler(Arc::new(Mutex::new(Vec::new()))),
        config(Duration::ZERO),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = timeout(Duration::from_secs(5), manager.run(cancel))
        .await
        .expect("manager returned");
    assert!(result.is_ok());
    assert!(manager.queue().is_empty());
}
