use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubemirror::kubemirror::controller::queue::{QueueConfig, WorkQueue};
use kubemirror::kubemirror::controller::reconcile::{reconcile_fn, ReconcileAction};
use kubemirror::kubemirror::k8s::store::ResourceKey;
use kubemirror::kubemirror::util::backoff::RetryPolicy;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn key(name: &str) -> ResourceKey {
    ResourceKey::new("default", name)
}

fn fast_retries(max_retries: Option<u32>) -> QueueConfig {
    QueueConfig {
        retry: RetryPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(10),
        },
        max_retries,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(10), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_reconciled_concurrently() {
    let queue = WorkQueue::new(fast_retries(None));
    let active: Arc<Mutex<HashSet<ResourceKey>>> = Arc::new(Mutex::new(HashSet::new()));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let reconciler = {
        let active = active.clone();
        let overlaps = overlaps.clone();
        let completed = completed.clone();
        Arc::new(reconcile_fn("Deployment", move |key: ResourceKey| {
            let active = active.clone();
            let overlaps = overlaps.clone();
            let completed = completed.clone();
            async move {
                if !active.lock().expect("active").insert(key.clone()) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                sleep(Duration::from_millis(1)).await;
                active.lock().expect("active").remove(&key);
                completed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(ReconcileAction::Done)
            }
        }))
    };

    let cancel = CancellationToken::new();
    let runner = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.run(8, reconciler, cancel).await })
    };

    let names = ["a", "b", "c", "d", "e"];
    for round in 0..50 {
        for name in names {
            queue.enqueue(key(name));
        }
        if round % 10 == 0 {
            sleep(Duration::from_millis(2)).await;
        }
    }

    eventually("queue to drain", || queue.is_empty() && queue.in_flight() == 0).await;

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let completed = completed.load(Ordering::SeqCst);
    assert!(completed >= names.len(), "every key reconciled at least once");
    assert!(completed <= names.len() * 50, "duplicates collapse while pending");

    cancel.cancel();
    timeout(Duration::from_secs(5), runner)
        .await
        .expect("workers stopped")
        .expect("join");
}

#[tokio::test]
async fn failing_key_is_dropped_after_max_retries() {
    let queue = WorkQueue::new(fast_retries(Some(3)));
    let attempts = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicUsize::new(0));

    let reconciler = {
        let attempts = attempts.clone();
        let healthy = healthy.clone();
        Arc::new(reconcile_fn("Deployment", move |key: ResourceKey| {
            let attempts = attempts.clone();
            let healthy = healthy.clone();
            async move {
                if key.name == "broken" {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    return Err(io::Error::other("upstream refused"));
                }
                healthy.fetch_add(1, Ordering::SeqCst);
                Ok(ReconcileAction::Done)
            }
        }))
    };

    let cancel = CancellationToken::new();
    let runner = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.run(2, reconciler, cancel).await })
    };

    queue.enqueue(key("broken"));
    queue.enqueue(key("fine"));

    eventually("broken key to be abandoned", || {
        attempts.load(Ordering::SeqCst) == 3 && queue.is_empty() && queue.in_flight() == 0
    })
    .await;
    sleep(Duration::from_millis(30)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(healthy.load(Ordering::SeqCst), 1);
    assert!(!queue.is_pending(&key("broken")));

    cancel.cancel();
    timeout(Duration::from_secs(5), runner)
        .await
        .expect("workers stopped")
        .expect("join");
}

#[tokio::test]
async fn requeue_after_schedules_another_pass() {
    let queue = WorkQueue::new(fast_retries(None));
    let passes = Arc::new(AtomicUsize::new(0));

    let reconciler = {
        let passes = passes.clone();
        Arc::new(reconcile_fn("Deployment", move |_key: ResourceKey| {
            let passes = passes.clone();
            async move {
                let pass = passes.fetch_add(1, Ordering::SeqCst) + 1;
                if pass < 3 {
                    Ok::<_, io::Error>(ReconcileAction::RequeueAfter(Duration::from_millis(10)))
                } else {
                    Ok(ReconcileAction::Done)
                }
            }
        }))
    };

    let cancel = CancellationToken::new();
    let runner = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.run(1, reconciler, cancel).await })
    };

    queue.enqueue(key("rolling"));
    eventually("three passes", || passes.load(Ordering::SeqCst) >= 3).await;
    eventually("queue to drain", || queue.is_empty() && queue.in_flight() == 0).await;
    assert_eq!(passes.load(Ordering::SeqCst), 3);

    cancel.cancel();
    timeout(Duration::from_secs(5), runner)
        .await
        .expect("workers stopped")
        .expect("join");
}
