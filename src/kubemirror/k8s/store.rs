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

//! In-memory mirror of remote records keyed by namespace/name.
//!
//! Every mutation is a whole-event operation performed under a single write
//! lock, so readers always observe either the state before or after an event.
//! Mutations return [`StoreDelta`] values describing what changed; callers
//! dispatch those after the lock has been released.

use super::deployment::Deployment;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn normalize_namespace(namespace: Option<&str>) -> String {
    namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or("default")
        .to_string()
}

/// Identity of a record: `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: normalize_namespace(Some(namespace.as_str())),
            name: name.into(),
        }
    }

    /// Parses `namespace/name`; a bare name lands in the default namespace.
    pub fn parse(value: &str) -> Option<Self> {
        match value.split_once('/') {
            Some((_, "")) => None,
            Some((namespace, name)) => Some(Self::new(namespace, name)),
            None if value.is_empty() => None,
            None => Some(Self::new("default", value)),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque resumption cursor for list/watch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for VersionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Orders two resource versions.
///
/// Numeric versions compare numerically. Anything else falls back to
/// length first and then lexicographic order, which agrees with numeric
/// order for unpadded decimal strings.
pub fn compare_resource_versions(left: &str, right: &str) -> Ordering {
    match (left.parse::<u64>(), right.parse::<u64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => left
            .len()
            .cmp(&right.len())
            .then_with(|| left.cmp(right)),
    }
}

/// True when `incoming` must not replace `stored`.
pub fn is_stale(incoming: Option<&str>, stored: Option<&str>) -> bool {
    match (incoming, stored) {
        (Some(incoming), Some(stored)) => {
            compare_resource_versions(incoming, stored) != Ordering::Greater
        }
        _ => false,
    }
}

/// A committed change to the store.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreDelta {
    Added(Deployment),
    Updated { old: Deployment, new: Deployment },
    Deleted(Deployment),
}

impl StoreDelta {
    pub fn key(&self) -> ResourceKey {
        match self {
            StoreDelta::Added(record) | StoreDelta::Deleted(record) => record.key(),
            StoreDelta::Updated { new, .. } => new.key(),
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            StoreDelta::Added(_) => "added",
            StoreDelta::Updated { .. } => "updated",
            StoreDelta::Deleted(_) => "deleted",
        }
    }
}

#[derive(Default)]
struct StoreState {
    records: HashMap<ResourceKey, Deployment>,
    /// Last version removed per key; cleared by an authoritative listing.
    tombstones: HashMap<ResourceKey, String>,
    token: VersionToken,
}

impl StoreState {
    fn advance(&mut self, candidate: Option<&str>) {
        let Some(candidate) = candidate.filter(|value| !value.is_empty()) else {
            return;
        };
        if self.token.is_empty()
            || compare_resource_versions(candidate, self.token.as_str()) == Ordering::Greater
        {
            self.token = VersionToken::new(candidate);
        }
    }
}

#[derive(Default)]
pub struct Store {
    state: RwLock<StoreState>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn version_token(&self) -> VersionToken {
        self.read().token.clone()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Deployment> {
        self.read().records.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.read().records.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Consistent copy of every record, ordered by key.
    pub fn snapshot(&self) -> Vec<Deployment> {
        let guard = self.read();
        let mut records: Vec<Deployment> = guard.records.values().cloned().collect();
        drop(guard);
        records.sort_by_key(|record| record.key());
        records
    }

    /// Replaces the whole store with an authoritative listing.
    ///
    /// Keys missing from `records` are tombstoned. Records whose version did
    /// not change produce no delta.
    pub fn replace(&self, records: Vec<Deployment>, token: VersionToken) -> Vec<StoreDelta> {
        let mut guard = self.write();
        let mut previous = std::mem::take(&mut guard.records);
        let mut deltas = Vec::new();
        let mut seen = HashSet::with_capacity(records.len());
        guard.tombstones.clear();

        for record in records {
            let key = record.key();
            seen.insert(key.clone());
            match previous.remove(&key) {
                None => deltas.push(StoreDelta::Added(record.clone())),
                Some(old) if old.resource_version() != record.resource_version() => {
                    deltas.push(StoreDelta::Updated {
                        old,
                        new: record.clone(),
                    })
                }
                Some(_) => {}
            }
            guard.records.insert(key, record);
        }

        let mut tombstones: Vec<Deployment> = previous
            .into_iter()
            .filter(|(key, _)| !seen.contains(key))
            .map(|(_, record)| record)
            .collect();
        tombstones.sort_by_key(|record| record.key());
        deltas.extend(tombstones.into_iter().map(StoreDelta::Deleted));

        guard.token = token;
        deltas
    }

    /// Inserts or updates a record unless it is no newer than the stored one
    /// or than the version at which the key was last removed. Returns `None`
    /// when the record was discarded as stale.
    pub fn upsert(&self, record: Deployment) -> Option<StoreDelta> {
        let key = record.key();
        let mut guard = self.write();
        let stale = match guard.records.get(&key) {
            Some(stored) => is_stale(record.resource_version(), stored.resource_version()),
            None => guard
                .tombstones
                .get(&key)
                .is_some_and(|removed| is_stale(record.resource_version(), Some(removed))),
        };
        guard.advance(record.resource_version());
        if stale {
            return None;
        }
        guard.tombstones.remove(&key);
        let delta = match guard.records.insert(key, record.clone()) {
            Some(old) => StoreDelta::Updated { old, new: record },
            None => StoreDelta::Added(record),
        };
        Some(delta)
    }

    /// Removes a record regardless of version. The returned delta carries the
    /// last stored state when one existed, else the record from the event.
    pub fn remove(&self, record: Deployment) -> StoreDelta {
        let key = record.key();
        let mut guard = self.write();
        guard.advance(record.resource_version());
        let removed = guard.records.remove(&key);
        let newest = [
            removed.as_ref().and_then(Deployment::resource_version),
            record.resource_version(),
            guard.tombstones.get(&key).map(String::as_str),
        ]
        .into_iter()
        .flatten()
        .filter(|version| !version.is_empty())
        .max_by(|a, b| compare_resource_versions(a, b))
        .map(str::to_string);
        if let Some(version) = newest {
            guard.tombstones.insert(key, version);
        }
        StoreDelta::Deleted(removed.unwrap_or(record))
    }

    /// Moves the cursor forward without touching records.
    pub fn advance(&self, token: &VersionToken) {
        self.write().advance(Some(token.as_str()));
    }
}
