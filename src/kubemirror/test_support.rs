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

//! In-memory collaborators shared by unit and integration tests.

use crate::kubemirror::api::client::{
    ClientError, ResourceClient, ResourceList, VersionToken, WatchEvent, WatchStream,
};
use crate::kubemirror::controller::dispatch::ResourceEventHandler;
use crate::kubemirror::k8s::deployment::{Deployment, DeploymentSpec, ObjectMeta};
use crate::kubemirror::k8s::store::ResourceKey;

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A Deployment in the default namespace with the given resource version.
pub fn deployment(name: &str, resource_version: &str) -> Deployment {
    deployment_in("default", name, resource_version)
}

pub fn deployment_in(namespace: &str, name: &str, resource_version: &str) -> Deployment {
    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        resource_version: Some(resource_version.to_string()).filter(|rv| !rv.is_empty()),
        generation: Some(1),
        ..Default::default()
    };
    let spec = DeploymentSpec {
        replicas: Some(1),
        ..Default::default()
    };
    Deployment::new(metadata, spec)
}

/// Journals every callback as `label:kind:name@resourceVersion`.
pub struct RecordingHandler {
    label: String,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    pub fn new(label: &str) -> Self {
        Self::with_journal(label, Arc::new(Mutex::new(Vec::new())))
    }

    /// Shares a journal with other handlers to observe cross-handler order.
    pub fn with_journal(label: &str, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            label: label.to_string(),
            journal,
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, kind: &str, record: &Deployment) {
        let entry = format!(
            "{}:{}:{}@{}",
            self.label,
            kind,
            record.name(),
            record.resource_version().unwrap_or("-")
        );
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

impl ResourceEventHandler for RecordingHandler {
    fn on_added(&self, record: &Deployment) {
        self.record("added", record);
    }

    fn on_updated(&self, _old: &Deployment, new: &Deployment) {
        self.record("updated", new);
    }

    fn on_deleted(&self, record: &Deployment) {
        self.record("deleted", record);
    }
}

type WatchItem = Result<WatchEvent, ClientError>;

#[derive(Default)]
struct FakeState {
    records: BTreeMap<ResourceKey, Deployment>,
    version: u64,
    list_errors: VecDeque<ClientError>,
    watch_errors: VecDeque<ClientError>,
    get_errors: VecDeque<ClientError>,
    watch_sender: Option<UnboundedSender<WatchItem>>,
    backlog: Vec<WatchItem>,
    list_calls: usize,
    get_calls: usize,
    watch_tokens: Vec<VersionToken>,
}

impl FakeState {
    fn send(&mut self, item: WatchItem) {
        if let Some(sender) = self.watch_sender.as_ref() {
            match sender.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => {
                    self.watch_sender = None;
                    self.backlog.push(item);
                    return;
                }
            }
        }
        self.backlog.push(item);
    }

    fn stamp(&mut self, record: &mut Deployment) {
        self.version += 1;
        record.metadata.resource_version = Some(self.version.to_string());
        if record.metadata.namespace.is_none() {
            record.metadata.namespace = Some(record.namespace());
        }
    }

    fn observe_version(&mut self, record: &Deployment) {
        if let Some(version) = record.resource_version().and_then(|rv| rv.parse::<u64>().ok()) {
            self.version = self.version.max(version);
        }
    }
}

/// Scriptable in-memory API server for one namespace.
///
/// Mutations made through the [`ResourceClient`] methods behave like a real
/// server: they bump the collection version and emit watch events. The
/// `emit*` helpers inject raw events (including stale ones) without touching
/// server state, and `replace_silently` changes state without any event.
#[derive(Default)]
pub struct FakeResourceClient {
    state: Mutex<FakeState>,
}

impl FakeResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets server state, keeping the given resource versions.
    pub fn seed(&self, records: Vec<Deployment>) {
        let mut state = self.state();
        for record in records {
            state.observe_version(&record);
            state.records.insert(record.key(), record);
        }
    }

    /// Replaces server state without emitting events, as if the watch missed them.
    pub fn replace_silently(&self, records: Vec<Deployment>) {
        let mut state = self.state();
        state.records.clear();
        for record in records {
            state.observe_version(&record);
            state.records.insert(record.key(), record);
        }
    }

    pub fn fail_next_list(&self, error: ClientError) {
        self.state().list_errors.push_back(error);
    }

    pub fn fail_next_watch(&self, error: ClientError) {
        self.state().watch_errors.push_back(error);
    }

    pub fn fail_next_get(&self, error: ClientError) {
        self.state().get_errors.push_back(error);
    }

    /// Delivers a raw event on the open watch, or on the next one.
    pub fn emit(&self, event: WatchEvent) {
        self.state().send(Ok(event));
    }

    pub fn emit_error(&self, error: ClientError) {
        self.state().send(Err(error));
    }

    /// Ends the open watch with an expired-cursor error.
    pub fn expire_watch(&self) {
        let mut state = self.state();
        state.send(Err(ClientError::Expired("too old resource version".into())));
        state.watch_sender = None;
    }

    /// Ends the open watch cleanly.
    pub fn close_watch(&self) {
        self.state().watch_sender = None;
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn get_calls(&self) -> usize {
        self.state().get_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.state().watch_tokens.len()
    }

    pub fn watch_tokens(&self) -> Vec<VersionToken> {
        self.state().watch_tokens.clone()
    }

    /// Polls until at least `count` watches have been opened.
    pub async fn wait_for_watches(&self, count: usize) {
        while self.watch_calls() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    async fn list(&self) -> Result<ResourceList, ClientError> {
        let mut state = self.state();
        state.list_calls += 1;
        if let Some(error) = state.list_errors.pop_front() {
            return Err(error);
        }
        Ok(ResourceList {
            items: state.records.values().cloned().collect(),
            version: VersionToken::new(state.version.to_string()),
        })
    }

    async fn watch(&self, from: &VersionToken) -> Result<WatchStream, ClientError> {
        let mut state = self.state();
        state.watch_tokens.push(from.clone());
        if let Some(error) = state.watch_errors.pop_front() {
            return Err(error);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        for item in state.backlog.drain(..) {
            let _ = sender.send(item);
        }
        state.watch_sender = Some(sender);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn get(&self, key: &ResourceKey) -> Result<Deployment, ClientError> {
        let mut state = self.state();
        state.get_calls += 1;
        if let Some(error) = state.get_errors.pop_front() {
            return Err(error);
        }
        state
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.clone()))
    }

    async fn create(&self, record: &Deployment) -> Result<Deployment, ClientError> {
        let mut state = self.state();
        let key = record.key();
        if state.records.contains_key(&key) {
            return Err(ClientError::Status {
                code: 409,
                message: format!("deployment {key} already exists"),
            });
        }
        let mut created = record.clone();
        state.stamp(&mut created);
        state.records.insert(key, created.clone());
        state.send(Ok(WatchEvent::Added(created.clone())));
        Ok(created)
    }

    async fn update(&self, record: &Deployment) -> Result<Deployment, ClientError> {
        let mut state = self.state();
        let key = record.key();
        if !state.records.contains_key(&key) {
            return Err(ClientError::NotFound(key));
        }
        let mut updated = record.clone();
        state.stamp(&mut updated);
        state.records.insert(key, updated.clone());
        state.send(Ok(WatchEvent::Modified(updated.clone())));
        Ok(updated)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClientError> {
        let mut state = self.state();
        let mut removed = state
            .records
            .remove(key)
            .ok_or_else(|| ClientError::NotFound(key.clone()))?;
        state.stamp(&mut removed);
        state.send(Ok(WatchEvent::Deleted(removed)));
        Ok(())
    }
}
