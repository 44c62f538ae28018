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

use crate::kubemirror::api::client::{ClientError, ResourceClient};
use crate::kubemirror::k8s::deployment::Deployment;
use crate::kubemirror::k8s::store::ResourceKey;
use crate::kubemirror::logger::{log_debug, log_info};

use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "deployment-controller";

/// What the queue should do with a key after a successful reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    Done,
    RequeueAfter(Duration),
}

/// Convergence step invoked by queue workers, one key at a time.
///
/// Implementations must treat the key as a hint and re-read authoritative
/// state; the cached record may already be outdated. Errors are retried
/// with backoff by the queue and never stop other keys.
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    /// Returns the logical kind handled by this reconciler (used for diagnostics).
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileAction, Self::Error>;
}

/// Adapts an async closure into a [`Reconciler`].
pub struct ReconcileFn<F> {
    kind: &'static str,
    f: F,
}

pub fn reconcile_fn<F>(kind: &'static str, f: F) -> ReconcileFn<F> {
    ReconcileFn { kind, f }
}

#[async_trait]
impl<F, Fut, E> Reconciler for ReconcileFn<F>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReconcileAction, E>> + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    type Error = E;

    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileAction, E> {
        (self.f)(key.clone()).await
    }
}

#[derive(Debug)]
pub struct ReconcileError {
    key: ResourceKey,
    source: ClientError,
}

impl ReconcileError {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to fetch deployment {}: {}", self.key, self.source)
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Rollout state derived from a freshly fetched Deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutState {
    Gone,
    Terminating,
    Progressing(String),
    Converged,
}

/// Tracks Deployment rollouts until they converge.
pub struct DeploymentReconciler {
    client: Arc<dyn ResourceClient>,
    progress_interval: Duration,
}

impl DeploymentReconciler {
    pub fn new(client: Arc<dyn ResourceClient>, progress_interval: Duration) -> Self {
        Self {
            client,
            progress_interval,
        }
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<Option<Deployment>, ReconcileError> {
        match self.client.get(key).await {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(source) => Err(ReconcileError {
                key: key.clone(),
                source,
            }),
        }
    }

    /// Compares desired replicas and generation against reported status.
    pub fn diff(record: Option<&Deployment>) -> RolloutState {
        let Some(record) = record else {
            return RolloutState::Gone;
        };
        if record.is_terminating() {
            return RolloutState::Terminating;
        }
        let desired = record.desired_replicas();
        let generation = record.metadata.generation.unwrap_or(0);
        let status = record.status.clone().unwrap_or_default();

        if status.observed_generation.unwrap_or(0) < generation {
            return RolloutState::Progressing(format!(
                "generation {generation} not yet observed"
            ));
        }
        if status.updated_replicas < desired {
            return RolloutState::Progressing(format!(
                "{} of {desired} replicas updated",
                status.updated_replicas
            ));
        }
        if status.replicas > status.updated_replicas {
            return RolloutState::Progressing(format!(
                "{} old replicas pending termination",
                status.replicas - status.updated_replicas
            ));
        }
        if status.available_replicas < desired {
            return RolloutState::Progressing(format!(
                "{} of {desired} replicas available",
                status.available_replicas
            ));
        }
        RolloutState::Converged
    }
}

#[async_trait]
impl Reconciler for DeploymentReconciler {
    type Error = ReconcileError;

    fn kind(&self) -> &'static str {
        "Deployment"
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileAction, ReconcileError> {
        let record = self.fetch(key).await?;
        let key_text = key.to_string();
        let action = match Self::diff(record.as_ref()) {
            RolloutState::Gone => {
                log_info(
                    COMPONENT,
                    "Deployment no longer exists; nothing to reconcile",
                    &[("key", key_text.as_str())],
                );
                ReconcileAction::Done
            }
            RolloutState::Terminating => {
                log_info(
                    COMPONENT,
                    "Deployment is terminating",
                    &[("key", key_text.as_str())],
                );
                ReconcileAction::Done
            }
            RolloutState::Progressing(detail) => {
                log_debug(
                    COMPONENT,
                    "Deployment rollout in progress",
                    &[("key", key_text.as_str()), ("detail", detail.as_str())],
                );
                ReconcileAction::RequeueAfter(self.progress_interval)
            }
            RolloutState::Converged => {
                log_info(
                    COMPONENT,
                    "Deployment reconciled",
                    &[("key", key_text.as_str())],
                );
                ReconcileAction::Done
            }
        };
        Ok(action)
    }
}
