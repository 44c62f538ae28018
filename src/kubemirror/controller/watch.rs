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

//! List-then-watch cache of remote Deployments.

use super::dispatch::{EventDispatcher, ResourceEventHandler};
use crate::kubemirror::api::client::{ClientError, ResourceClient, VersionToken, WatchEvent};
use crate::kubemirror::k8s::deployment::Deployment;
use crate::kubemirror::k8s::store::{ResourceKey, Store};
use crate::kubemirror::logger::{log_debug, log_error, log_info, log_warn};
use crate::kubemirror::observability::metrics::{self, RelistReason, WatchEventResult};
use crate::kubemirror::util::backoff::Backoff;

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "informer";
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

#[derive(Clone, Debug)]
pub struct WatchCacheConfig {
    /// Unconditional relist interval.
    pub relist_period: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for WatchCacheConfig {
    fn default() -> Self {
        Self {
            relist_period: Duration::from_secs(300),
            backoff_initial: Duration::from_millis(BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(BACKOFF_MAX_MS),
        }
    }
}

enum StreamOutcome {
    Relist(RelistReason),
    Reconnect,
}

/// Local mirror kept current by a single list/watch task.
pub struct WatchCache {
    client: Arc<dyn ResourceClient>,
    store: Store,
    dispatcher: EventDispatcher,
    synced: watch::Sender<bool>,
    config: WatchCacheConfig,
}

impl WatchCache {
    pub fn new(client: Arc<dyn ResourceClient>, config: WatchCacheConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            client,
            store: Store::new(),
            dispatcher: EventDispatcher::new(),
            synced,
            config,
        }
    }

    /// Registers a handler; handlers run in registration order.
    pub fn subscribe(&self, handler: Arc<dyn ResourceEventHandler>) {
        self.dispatcher.subscribe(handler);
    }

    /// True once the first listing has been applied. Never reverts.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits for the first listing. Returns false if cancelled first.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut receiver = self.synced.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => false,
            result = receiver.wait_for(|synced| *synced) => result.is_ok(),
        }
    }

    pub fn snapshot(&self) -> Vec<Deployment> {
        self.store.snapshot()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.store.keys()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Deployment> {
        self.store.get(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn version_token(&self) -> VersionToken {
        self.store.version_token()
    }

    /// Runs list/watch until `cancel` fires.
    ///
    /// Before the first successful listing a non-transient error is returned
    /// to the caller, except an expired cursor, which is always relisted.
    /// After that every failure is retried.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        log_info(COMPONENT, "Starting deployment informer", &[]);
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut pending_relist = Some(RelistReason::Initial);
        let mut next_relist = Instant::now() + self.config.relist_period;

        loop {
            if let Some(reason) = pending_relist {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    result = self.relist(reason) => result,
                };
                match result {
                    Ok(()) => {
                        pending_relist = None;
                        backoff.reset();
                        next_relist = Instant::now() + self.config.relist_period;
                    }
                    Err(err) if !self.has_synced() && !err.is_transient() && !err.is_expired() => {
                        log_error(
                            COMPONENT,
                            "Initial deployment list failed",
                            &[("error", err.to_string().as_str())],
                        );
                        return Err(err);
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();
                        log_warn(
                            COMPONENT,
                            "Failed to list deployments",
                            &[
                                ("error", err.to_string().as_str()),
                                ("retry_in", format!("{delay:?}").as_str()),
                            ],
                        );
                        if !sleep_or_cancel(delay, &cancel).await {
                            return Ok(());
                        }
                        pending_relist = Some(if err.is_expired() {
                            RelistReason::Expired
                        } else {
                            RelistReason::Retry
                        });
                        continue;
                    }
                }
            }

            let token = self.store.version_token();
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                opened = self.client.watch(&token) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(err) if err.is_expired() => {
                    log_info(
                        COMPONENT,
                        "Watch cursor expired; relisting",
                        &[("resource_version", token.as_str())],
                    );
                    pending_relist = Some(RelistReason::Expired);
                    continue;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    log_warn(
                        COMPONENT,
                        "Failed to open deployment watch",
                        &[
                            ("error", err.to_string().as_str()),
                            ("retry_in", format!("{delay:?}").as_str()),
                        ],
                    );
                    if !sleep_or_cancel(delay, &cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = sleep_until(next_relist) => break StreamOutcome::Relist(RelistReason::Periodic),
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            backoff.reset();
                            self.apply_event(event);
                        }
                        Some(Err(err)) if err.is_expired() => {
                            log_info(
                                COMPONENT,
                                "Watch cursor expired; relisting",
                                &[("error", err.to_string().as_str())],
                            );
                            break StreamOutcome::Relist(RelistReason::Expired);
                        }
                        Some(Err(err)) => {
                            log_warn(
                                COMPONENT,
                                "Deployment watch failed",
                                &[("error", err.to_string().as_str())],
                            );
                            break StreamOutcome::Reconnect;
                        }
                        None => {
                            log_debug(COMPONENT, "Deployment watch closed; relisting", &[]);
                            break StreamOutcome::Relist(RelistReason::StreamClosed);
                        }
                    },
                }
            };
            drop(stream);

            match outcome {
                StreamOutcome::Relist(reason) => pending_relist = Some(reason),
                StreamOutcome::Reconnect => {
                    if !sleep_or_cancel(backoff.next_delay(), &cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Fetches a full listing and replaces the store with it, dispatching the
    /// difference. Keys that vanished are delivered as deletions.
    pub async fn relist(&self, reason: RelistReason) -> Result<(), ClientError> {
        let listing = self.client.list().await?;
        let count = listing.items.len();
        let deltas = self.store.replace(listing.items, listing.version);
        metrics::record_relist(reason);
        metrics::set_cache_objects(count);

        let first_sync = !self.synced.send_replace(true);
        if first_sync {
            log_info(
                COMPONENT,
                "Deployment informer cache synced. Watching for events...",
                &[("count", count.to_string().as_str())],
            );
        } else {
            log_debug(
                COMPONENT,
                "Relisted deployments",
                &[
                    ("reason", reason.as_label()),
                    ("count", count.to_string().as_str()),
                    ("changes", deltas.len().to_string().as_str()),
                ],
            );
        }

        for delta in &deltas {
            self.dispatcher.dispatch(delta);
        }
        Ok(())
    }

    /// Applies one watch event to the store and dispatches the result.
    /// Stale and duplicate events are dropped without dispatch.
    pub fn apply_event(&self, event: WatchEvent) {
        let event_type = event.type_label();
        let delta = match event {
            WatchEvent::Added(record) | WatchEvent::Modified(record) => self.store.upsert(record),
            WatchEvent::Deleted(record) => Some(self.store.remove(record)),
            WatchEvent::Bookmark(token) => {
                self.store.advance(&token);
                return;
            }
        };

        match delta {
            Some(delta) => {
                metrics::record_watch_event(event_type, WatchEventResult::Applied);
                metrics::set_cache_objects(self.store.len());
                self.dispatcher.dispatch(&delta);
            }
            None => {
                metrics::record_watch_event(event_type, WatchEventResult::Stale);
                log_debug(
                    COMPONENT,
                    "Discarded stale deployment event",
                    &[("type", event_type)],
                );
            }
        }
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
