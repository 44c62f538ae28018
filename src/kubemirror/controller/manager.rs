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

use super::dispatch::LoggingHandler;
use super::queue::{QueueConfig, QueueingHandler, WorkQueue};
use super::reconcile::Reconciler;
use super::watch::{WatchCache, WatchCacheConfig};
use crate::kubemirror::api::client::{ClientError, ResourceClient};
use crate::kubemirror::logger::{log_debug, log_info};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller";

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub workers: usize,
    /// Interval at which every cached key is re-enqueued. Zero disables it.
    pub resync_period: Duration,
    pub watch: WatchCacheConfig,
    pub queue: QueueConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            resync_period: Duration::from_secs(25),
            watch: WatchCacheConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Wires the watch cache, the work queue, and a reconciler together.
pub struct ControllerManager<R> {
    cache: Arc<WatchCache>,
    queue: WorkQueue,
    reconciler: Arc<R>,
    config: ManagerConfig,
}

impl<R> ControllerManager<R>
where
    R: Reconciler + 'static,
{
    /// Builds the pipeline. Logging runs before queueing for every event.
    pub fn new(client: Arc<dyn ResourceClient>, reconciler: Arc<R>, config: ManagerConfig) -> Self {
        let cache = Arc::new(WatchCache::new(client, config.watch.clone()));
        let queue = WorkQueue::new(config.queue);
        cache.subscribe(Arc::new(LoggingHandler));
        cache.subscribe(Arc::new(QueueingHandler::new(queue.clone())));
        Self {
            cache,
            queue,
            reconciler,
            config,
        }
    }

    pub fn cache(&self) -> Arc<WatchCache> {
        self.cache.clone()
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Runs until `cancel` fires or the cache fails to start. Workers start
    /// once the cache has synced.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        let scope = cancel.child_token();

        let watch = async {
            let result = self.cache.start(scope.clone()).await;
            if result.is_err() {
                scope.cancel();
            }
            result
        };
        let workers = async {
            if !self.cache.wait_for_sync(&scope).await {
                return;
            }
            log_info(
                COMPONENT,
                "Starting workers",
                &[
                    ("controller", self.reconciler.kind()),
                    ("workers", self.config.workers.max(1).to_string().as_str()),
                ],
            );
            self.queue
                .run(self.config.workers, self.reconciler.clone(), scope.clone())
                .await;
        };
        let resync = self.resync_loop(&scope);

        let (result, (), ()) = tokio::join!(watch, workers, resync);
        log_info(COMPONENT, "Controller stopped", &[("controller", self.reconciler.kind())]);
        result
    }

    /// Enqueues every cached key on each resync tick.
    pub fn resync(&self) -> usize {
        let keys = self.cache.keys();
        let count = keys.len();
        for key in keys {
            self.queue.enqueue(key);
        }
        count
    }

    async fn resync_loop(&self, cancel: &CancellationToken) {
        let period = self.config.resync_period;
        if period.is_zero() {
            cancel.cancelled().await;
            return;
        }
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if !self.cache.has_synced() {
                        continue;
                    }
                    let count = self.resync();
                    log_debug(
                        COMPONENT,
                        "Periodic resync enqueued keys",
                        &[("count", count.to_string().as_str())],
                    );
                }
            }
        }
    }
}
