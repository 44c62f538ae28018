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

use crate::kubemirror::k8s::deployment::Deployment;
use crate::kubemirror::k8s::store::StoreDelta;
use crate::kubemirror::logger::log_info;

use std::sync::{Arc, PoisonError, RwLock};

const COMPONENT: &str = "informer";

/// Receives committed cache mutations.
///
/// Handlers run on the watch loop itself, after the store has been updated
/// and before the next event is read.
pub trait ResourceEventHandler: Send + Sync {
    fn on_added(&self, record: &Deployment);

    fn on_updated(&self, old: &Deployment, new: &Deployment);

    fn on_deleted(&self, record: &Deployment);
}

/// Fans committed deltas out to handlers in registration order.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn ResourceEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn dispatch(&self, delta: &StoreDelta) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers.iter() {
            match delta {
                StoreDelta::Added(record) => handler.on_added(record),
                StoreDelta::Updated { old, new } => handler.on_updated(old, new),
                StoreDelta::Deleted(record) => handler.on_deleted(record),
            }
        }
    }
}

/// Logs every mutation at info level.
pub struct LoggingHandler;

impl ResourceEventHandler for LoggingHandler {
    fn on_added(&self, record: &Deployment) {
        log_info(
            COMPONENT,
            "Deployment added",
            &[
                ("namespace", record.namespace().as_str()),
                ("name", record.name()),
                ("resource_version", record.resource_version().unwrap_or("")),
            ],
        );
    }

    fn on_updated(&self, old: &Deployment, new: &Deployment) {
        log_info(
            COMPONENT,
            "Deployment updated",
            &[
                ("namespace", new.namespace().as_str()),
                ("name", new.name()),
                ("old_resource_version", old.resource_version().unwrap_or("")),
                ("resource_version", new.resource_version().unwrap_or("")),
            ],
        );
    }

    fn on_deleted(&self, record: &Deployment) {
        log_info(
            COMPONENT,
            "Deployment deleted",
            &[("namespace", record.namespace().as_str()), ("name", record.name())],
        );
    }
}
