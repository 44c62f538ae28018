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

//! Deduplicating, time-ordered work queue with per-key mutual exclusion.
//!
//! A key is pending at most once. Re-enqueueing a pending key merges into the
//! existing entry and keeps the earlier due time. Keys being reconciled sit in
//! an in-flight set and are skipped at dequeue time, so a key can be pending
//! and in flight at once but never handed to two workers.

use super::dispatch::ResourceEventHandler;
use super::reconcile::{ReconcileAction, Reconciler};
use crate::kubemirror::k8s::deployment::Deployment;
use crate::kubemirror::k8s::store::ResourceKey;
use crate::kubemirror::logger::{log_debug, log_error, log_warn};
use crate::kubemirror::observability::metrics::{self, ControllerReconcileResult};
use crate::kubemirror::observability::tracing;
use crate::kubemirror::util::backoff::RetryPolicy;

use futures_util::FutureExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "workqueue";

/// A key handed to a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub key: ResourceKey,
    /// Consecutive failed attempts so far.
    pub attempts: u32,
    pub not_before: Instant,
}

/// How a worker finished with an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkOutcome {
    Done,
    RequeueAfter(Duration),
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    /// Failed attempts after which an item is dropped. `None` retries forever.
    pub max_retries: Option<u32>,
}

struct Pending {
    attempts: u32,
    not_before: Instant,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<ResourceKey, Pending>,
    order: BTreeSet<(Instant, u64, ResourceKey)>,
    in_flight: HashSet<ResourceKey>,
    seq: u64,
    shutting_down: bool,
}

impl QueueState {
    fn schedule(&mut self, key: ResourceKey, attempts: u32, not_before: Instant) {
        self.seq += 1;
        let seq = self.seq;
        match self.pending.get_mut(&key) {
            Some(existing) => {
                existing.attempts = existing.attempts.max(attempts);
                if not_before < existing.not_before {
                    self.order
                        .remove(&(existing.not_before, existing.seq, key.clone()));
                    existing.not_before = not_before;
                    existing.seq = seq;
                    self.order.insert((not_before, seq, key));
                }
            }
            None => {
                self.order.insert((not_before, seq, key.clone()));
                self.pending.insert(
                    key,
                    Pending {
                        attempts,
                        not_before,
                        seq,
                    },
                );
            }
        }
    }

    /// Pops the earliest due item whose key is not in flight. Otherwise
    /// returns the due time of the earliest eligible item, if any.
    fn pop_ready(&mut self, now: Instant) -> Result<WorkItem, Option<Instant>> {
        let candidate = self
            .order
            .iter()
            .find(|(_, _, key)| !self.in_flight.contains(key))
            .cloned();
        let Some(entry) = candidate else {
            return Err(None);
        };
        let (not_before, _, ref key) = entry;
        if not_before > now {
            return Err(Some(not_before));
        }
        self.order.remove(&entry);
        let pending = self.pending.remove(key);
        self.in_flight.insert(key.clone());
        Ok(WorkItem {
            key: key.clone(),
            attempts: pending.map(|p| p.attempts).unwrap_or_default(),
            not_before,
        })
    }
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

/// Shared handle; clones refer to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, key: ResourceKey) {
        self.enqueue_after(key, Duration::ZERO);
    }

    pub fn enqueue_after(&self, key: ResourceKey, delay: Duration) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        state.schedule(key, 0, Instant::now() + delay);
        metrics::set_queue_depth(state.pending.len());
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Keys waiting to be processed, including ones that are also in flight.
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        self.state().pending.contains_key(key)
    }

    /// Stops handing out items; waiting workers return `None`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Waits for the next due item whose key is not in flight. Returns `None`
    /// on cancellation or shutdown.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state();
                if state.shutting_down || cancel.is_cancelled() {
                    return None;
                }
                match state.pop_ready(Instant::now()) {
                    Ok(item) => return Some(item),
                    Err(deadline) => deadline,
                }
            };

            match deadline {
                Some(deadline) => tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = &mut notified => {}
                    _ = sleep_until(deadline) => {}
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = &mut notified => {}
                },
            }
        }
    }

    /// Releases an item's key and reschedules it according to `outcome`.
    /// Returns false when a failed item was abandoned.
    pub fn done(&self, item: WorkItem, outcome: WorkOutcome) -> bool {
        let mut state = self.state();
        state.in_flight.remove(&item.key);
        let mut retained = true;
        match outcome {
            WorkOutcome::Done => {}
            WorkOutcome::RequeueAfter(delay) => {
                if !state.shutting_down {
                    state.schedule(item.key.clone(), 0, Instant::now() + delay);
                }
            }
            WorkOutcome::Failed => {
                let attempts = item.attempts.saturating_add(1);
                let exhausted = self
                    .inner
                    .config
                    .max_retries
                    .is_some_and(|max| attempts >= max);
                if exhausted {
                    retained = false;
                } else if !state.shutting_down {
                    let delay = self.inner.config.retry.delay_for(attempts);
                    state.schedule(item.key.clone(), attempts, Instant::now() + delay);
                }
            }
        }
        metrics::set_queue_depth(state.pending.len());
        drop(state);
        self.inner.notify.notify_waiters();

        if !retained {
            log_warn(
                COMPONENT,
                "Dropping key after repeated reconcile failures",
                &[
                    ("key", item.key.to_string().as_str()),
                    ("attempts", item.attempts.saturating_add(1).to_string().as_str()),
                ],
            );
        }
        retained
    }

    /// Runs `workers` tasks draining the queue through `reconciler` until
    /// `cancel` fires. In-progress reconciles finish before this returns.
    pub async fn run<R>(&self, workers: usize, reconciler: Arc<R>, cancel: CancellationToken)
    where
        R: Reconciler + 'static,
    {
        let mut tasks = JoinSet::new();
        for worker in 0..workers.max(1) {
            let queue = self.clone();
            let reconciler = reconciler.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { queue.worker_loop(worker, reconciler, cancel).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                log_error(
                    COMPONENT,
                    "Worker task terminated unexpectedly",
                    &[("error", err.to_string().as_str())],
                );
            }
        }
    }

    async fn worker_loop<R>(&self, worker: usize, reconciler: Arc<R>, cancel: CancellationToken)
    where
        R: Reconciler + 'static,
    {
        let kind = reconciler.kind();
        while let Some(item) = self.next(&cancel).await {
            let started = std::time::Instant::now();
            let attempt = AssertUnwindSafe(tracing::with_span(
                COMPONENT,
                "reconcile",
                reconciler.reconcile(&item.key),
            ))
            .catch_unwind()
            .await;
            let elapsed = started.elapsed();

            let outcome = match attempt {
                Ok(Ok(ReconcileAction::Done)) => {
                    metrics::record_controller_reconcile(
                        kind,
                        ControllerReconcileResult::Success,
                        elapsed,
                    );
                    WorkOutcome::Done
                }
                Ok(Ok(ReconcileAction::RequeueAfter(delay))) => {
                    metrics::record_controller_reconcile(
                        kind,
                        ControllerReconcileResult::Requeue,
                        elapsed,
                    );
                    log_debug(
                        COMPONENT,
                        "Requeueing key",
                        &[
                            ("key", item.key.to_string().as_str()),
                            ("after", format!("{delay:?}").as_str()),
                        ],
                    );
                    WorkOutcome::RequeueAfter(delay)
                }
                Ok(Err(err)) => {
                    metrics::record_controller_reconcile(
                        kind,
                        ControllerReconcileResult::Error,
                        elapsed,
                    );
                    log_error(
                        COMPONENT,
                        "Reconcile failed",
                        &[
                            ("controller", kind),
                            ("key", item.key.to_string().as_str()),
                            ("attempt", (item.attempts + 1).to_string().as_str()),
                            ("worker", worker.to_string().as_str()),
                            ("error", err.to_string().as_str()),
                        ],
                    );
                    WorkOutcome::Failed
                }
                Err(_) => {
                    metrics::record_controller_reconcile(
                        kind,
                        ControllerReconcileResult::Error,
                        elapsed,
                    );
                    log_error(
                        COMPONENT,
                        "Reconcile panicked",
                        &[
                            ("controller", kind),
                            ("key", item.key.to_string().as_str()),
                        ],
                    );
                    WorkOutcome::Failed
                }
            };

            if !self.done(item, outcome) {
                metrics::record_controller_reconcile(
                    kind,
                    ControllerReconcileResult::Abandoned,
                    Duration::ZERO,
                );
            }
        }
    }
}

/// Enqueues the key of every dispatched record.
pub struct QueueingHandler {
    queue: WorkQueue,
}

impl QueueingHandler {
    pub fn new(queue: WorkQueue) -> Self {
        Self { queue }
    }
}

impl ResourceEventHandler for QueueingHandler {
    fn on_added(&self, record: &Deployment) {
        self.queue.enqueue(record.key());
    }

    fn on_updated(&self, _old: &Deployment, new: &Deployment) {
        self.queue.enqueue(new.key());
    }

    fn on_deleted(&self, record: &Deployment) {
        self.queue.enqueue(record.key());
    }
}
