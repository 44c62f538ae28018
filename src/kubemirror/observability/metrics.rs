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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static WATCH_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RELISTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CACHE_OBJECTS: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("kubemirror".to_string()), None)
            .expect("failed to initialise kubemirror metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register kubemirror metric collector");
    collector
}

fn watch_events_total() -> &'static IntCounterVec {
    WATCH_EVENTS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "events_total",
            "Watch events received grouped by type and whether they were applied",
        )
        .subsystem("watch");
        let counter = IntCounterVec::new(opts, &["type", "result"])
            .expect("failed to build watch events counter");
        register_collector(counter)
    })
}

fn relists_total() -> &'static IntCounterVec {
    RELISTS_TOTAL.get_or_init(|| {
        let opts = Opts::new("relists_total", "Full relists grouped by trigger").subsystem("watch");
        let counter =
            IntCounterVec::new(opts, &["reason"]).expect("failed to build relists counter");
        register_collector(counter)
    })
}

fn cache_objects() -> &'static IntGauge {
    CACHE_OBJECTS.get_or_init(|| {
        let opts = Opts::new("objects", "Records currently held by the watch cache")
            .subsystem("cache");
        let gauge = IntGauge::with_opts(opts).expect("failed to build cache objects gauge");
        register_collector(gauge)
    })
}

fn queue_depth() -> &'static IntGauge {
    QUEUE_DEPTH.get_or_init(|| {
        let opts = Opts::new("depth", "Keys waiting in the work queue").subsystem("queue");
        let gauge = IntGauge::with_opts(opts).expect("failed to build queue depth gauge");
        register_collector(gauge)
    })
}

fn reconciles_total() -> &'static IntCounterVec {
    RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn reconcile_duration() -> &'static HistogramVec {
    RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "controller_reconcile_duration_seconds",
            "Latency distribution for controller reconciliation attempts",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build controller reconcile histogram");
        register_collector(histogram)
    })
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        let opts = Opts::new("requests_total", "Query requests grouped by route").subsystem("http");
        let counter =
            IntCounterVec::new(opts, &["route"]).expect("failed to build http requests counter");
        register_collector(counter)
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventResult {
    Applied,
    Stale,
}

impl WatchEventResult {
    fn as_label(self) -> &'static str {
        match self {
            WatchEventResult::Applied => "applied",
            WatchEventResult::Stale => "stale",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelistReason {
    Initial,
    Expired,
    StreamClosed,
    Periodic,
    Retry,
}

impl RelistReason {
    pub fn as_label(self) -> &'static str {
        match self {
            RelistReason::Initial => "initial",
            RelistReason::Expired => "expired",
            RelistReason::StreamClosed => "stream_closed",
            RelistReason::Periodic => "periodic",
            RelistReason::Retry => "retry",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerReconcileResult {
    Success,
    Requeue,
    Error,
    Abandoned,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Requeue => "requeue",
            ControllerReconcileResult::Error => "error",
            ControllerReconcileResult::Abandoned => "abandoned",
        }
    }
}

pub fn record_watch_event(event_type: &str, result: WatchEventResult) {
    watch_events_total()
        .with_label_values(&[event_type, result.as_label()])
        .inc();
}

pub fn record_relist(reason: RelistReason) {
    relists_total().with_label_values(&[reason.as_label()]).inc();
}

pub fn set_cache_objects(count: usize) {
    cache_objects().set(count as i64);
}

pub fn set_queue_depth(depth: usize) {
    queue_depth().set(depth as i64);
}

pub fn record_controller_reconcile(
    controller: &str,
    result: ControllerReconcileResult,
    elapsed: Duration,
) {
    reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
    reconcile_duration()
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

pub fn record_http_request(route: &str) {
    http_requests_total().with_label_values(&[route]).inc();
}

pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
