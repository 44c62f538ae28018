use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubemirror::kubemirror::api::client::{ClientError, ResourceClient, WatchEvent};
use kubemirror::kubemirror::controller::lister::DeploymentLister;
use kubemirror::kubemirror::controller::watch::{WatchCache, WatchCacheConfig};
use kubemirror::kubemirror::k8s::store::ResourceKey;
use kubemirror::kubemirror::test_support::{deployment, FakeResourceClient, RecordingHandler};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

struct Harness {
    client: Arc<FakeResourceClient>,
    cache: Arc<WatchCache>,
    journal: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start(client: Arc<FakeResourceClient>, relist_period: Duration) -> Self {
        let config = WatchCacheConfig {
            relist_period,
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        };
        let cache = Arc::new(WatchCache::new(client.clone(), config));
        let journal = Arc::new(Mutex::new(Vec::new()));
        cache.subscribe(Arc::new(RecordingHandler::with_journal("h", journal.clone())));

        let cancel = CancellationToken::new();
        let task = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cache.start(cancel).await.expect("watch loop");
            })
        };
        assert!(
            timeout(Duration::from_secs(5), cache.wait_for_sync(&cancel))
                .await
                .expect("sync in time"),
            "cache should sync"
        );
        Self {
            client,
            cache,
            journal,
            cancel,
            task,
        }
    }

    fn entries(&self) -> Vec<String> {
        self.journal.lock().expect("journal").clone()
    }

    async fn stop(self) {
        self.cancel.cancel();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("watch loop stopped")
            .expect("join");
    }
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

fn names(cache: &WatchCache) -> Vec<String> {
    cache.list_names()
}

#[tokio::test]
async fn cache_converges_to_server_state_after_mutations() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1"), deployment("y", "2")]);
    let harness = Harness::start(client.clone(), Duration::from_secs(300)).await;
    client.wait_for_watches(1).await;

    assert_eq!(names(&harness.cache), vec!["x", "y"]);

    client.create(&deployment("z", "")).await.expect("create z");
    let mut updated = deployment("x", "1");
    updated.spec.replicas = Some(3);
    client.update(&updated).await.expect("update x");
    client
        .delete(&ResourceKey::new("default", "y"))
        .await
        .expect("delete y");

    eventually("cache to converge", || names(&harness.cache) == vec!["x", "z"]).await;

    let server = client.list().await.expect("list");
    let mut expected = server.items.clone();
    expected.sort_by_key(|record| record.key());
    assert_eq!(harness.cache.snapshot(), expected);
    assert_eq!(harness.cache.version_token(), server.version);

    harness.stop().await;
}

#[tokio::test]
async fn per_key_events_dispatch_in_order_and_stale_events_are_dropped() {
    let client = Arc::new(FakeResourceClient::new());
    let harness = Harness::start(client.clone(), Duration::from_secs(300)).await;
    client.wait_for_watches(1).await;

    client.emit(WatchEvent::Added(deployment("x", "5")));
    client.emit(WatchEvent::Modified(deployment("x", "6")));
    client.emit(WatchEvent::Modified(deployment("x", "5")));
    client.emit(WatchEvent::Modified(deployment("x", "8")));

    eventually("three dispatches", || harness.entries().len() >= 3).await;
    sleep(Duration::from_millis(20)).await;

    assert_eq!(
        harness.entries(),
        vec!["h:added:x@5", "h:updated:x@6", "h:updated:x@8"]
    );
    assert_eq!(
        harness
            .cache
            .get(&ResourceKey::new("default", "x"))
            .and_then(|record| record.resource_version().map(str::to_string)),
        Some("8".to_string())
    );

    harness.stop().await;
}

#[tokio::test]
async fn deleted_event_removes_key_and_notifies_handlers() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1"), deployment("y", "2")]);
    let harness = Harness::start(client.clone(), Duration::from_secs(300)).await;
    client.wait_for_watches(1).await;

    client.emit(WatchEvent::Deleted(deployment("y", "3")));

    eventually("y to disappear", || names(&harness.cache) == vec!["x"]).await;
    let entries = harness.entries();
    assert!(
        entries.iter().any(|entry| entry.starts_with("h:deleted:y@")),
        "missing delete notification: {entries:?}"
    );

    harness.stop().await;
}

#[tokio::test]
async fn expired_cursor_relists_and_emits_tombstones() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1"), deployment("y", "2")]);
    let harness = Harness::start(client.clone(), Duration::from_secs(300)).await;
    client.wait_for_watches(1).await;
    assert_eq!(harness.entries(), vec!["h:added:x@1", "h:added:y@2"]);

    client.replace_silently(vec![deployment("x", "1"), deployment("z", "5")]);
    client.expire_watch();

    eventually("relist after expiry", || names(&harness.cache) == vec!["x", "z"]).await;
    client.wait_for_watches(2).await;

    let entries = harness.entries();
    assert!(entries.contains(&"h:added:z@5".to_string()), "{entries:?}");
    assert!(entries.contains(&"h:deleted:y@2".to_string()), "{entries:?}");
    assert_eq!(
        entries.iter().filter(|entry| entry.contains(":x@")).count(),
        1,
        "unchanged records must not be redelivered: {entries:?}"
    );
    assert_eq!(client.list_calls(), 2);
    assert_eq!(client.watch_tokens()[1].as_str(), "5");

    harness.stop().await;
}

#[tokio::test]
async fn transient_watch_failures_reconnect_without_relisting() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("a", "1")]);
    client.fail_next_watch(ClientError::Transport("connection reset".into()));
    let harness = Harness::start(client.clone(), Duration::from_secs(300)).await;

    client.wait_for_watches(2).await;
    client.emit_error(ClientError::Status {
        code: 500,
        message: "stream reset".into(),
    });
    client.wait_for_watches(3).await;

    client.emit(WatchEvent::Added(deployment("b", "2")));
    eventually("b to arrive", || names(&harness.cache) == vec!["a", "b"]).await;

    assert_eq!(client.list_calls(), 1);
    let tokens: Vec<String> = client
        .watch_tokens()
        .iter()
        .map(|token| token.as_str().to_string())
        .collect();
    assert_eq!(tokens, vec!["1", "1", "1"]);

    harness.stop().await;
}

#[tokio::test]
async fn closed_stream_triggers_relist() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1")]);
    let harness = Harness::start(client.clone(), Duration::from_secs(300)).await;
    client.wait_for_watches(1).await;

    client.close_watch();

    eventually("relist after close", || client.list_calls() >= 2).await;
    client.wait_for_watches(2).await;
    assert!(harness.cache.has_synced());

    harness.stop().await;
}

#[tokio::test]
async fn periodic_timer_relists_while_watching() {
    let client = Arc::new(FakeResourceClient::new());
    client.seed(vec![deployment("x", "1")]);
    let harness = Harness::start(client.clone(), Duration::from_millis(40)).await;

    eventually("periodic relists", || client.list_calls() >= 3).await;
    assert_eq!(names(&harness.cache), vec!["x"]);

    harness.stop().await;
}
