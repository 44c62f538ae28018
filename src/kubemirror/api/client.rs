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

//! Contract between the mirror and the remote orchestration API.

use crate::kubemirror::k8s::deployment::Deployment;
use crate::kubemirror::k8s::store::ResourceKey;
pub use crate::kubemirror::k8s::store::VersionToken;

use async_trait::async_trait;
use futures_util::Stream;
use std::error::Error;
use std::fmt;
use std::pin::Pin;

/// One change notification delivered by a watch.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Added(Deployment),
    Modified(Deployment),
    Deleted(Deployment),
    /// Progress marker carrying only a newer cursor.
    Bookmark(VersionToken),
}

impl WatchEvent {
    pub fn type_label(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
            WatchEvent::Bookmark(_) => "BOOKMARK",
        }
    }
}

/// Result of a full listing.
#[derive(Clone, Debug, Default)]
pub struct ResourceList {
    pub items: Vec<Deployment>,
    pub version: VersionToken,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, ClientError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Connection-level failure; retrying later may succeed.
    Transport(String),
    /// The resumption cursor is too old; a full relist is required.
    Expired(String),
    NotFound(ResourceKey),
    Status { code: u16, message: String },
    Decode(String),
    Config(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Status { code, .. } => *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, ClientError::Expired(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(message) => write!(f, "transport error: {message}"),
            ClientError::Expired(message) => write!(f, "resource version expired: {message}"),
            ClientError::NotFound(key) => write!(f, "deployment {key} not found"),
            ClientError::Status { code, message } => {
                write!(f, "request failed with status {code}: {message}")
            }
            ClientError::Decode(message) => write!(f, "failed to decode response: {message}"),
            ClientError::Config(message) => write!(f, "invalid client configuration: {message}"),
        }
    }
}

impl Error for ClientError {}

/// Access to the remote Deployment collection of one namespace.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(&self) -> Result<ResourceList, ClientError>;

    /// Opens a change stream resuming after `from`.
    async fn watch(&self, from: &VersionToken) -> Result<WatchStream, ClientError>;

    async fn get(&self, key: &ResourceKey) -> Result<Deployment, ClientError>;

    async fn create(&self, record: &Deployment) -> Result<Deployment, ClientError>;

    async fn update(&self, record: &Deployment) -> Result<Deployment, ClientError>;

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(ClientError::Transport("reset".into()).is_transient());
        assert!(ClientError::Status {
            code: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(ClientError::Status {
            code: 429,
            message: "slow down".into()
        }
        .is_transient());
        assert!(!ClientError::Status {
            code: 403,
            message: "forbidden".into()
        }
        .is_transient());
        assert!(!ClientError::Expired("too old".into()).is_transient());
        assert!(ClientError::Expired("too old".into()).is_expired());
        assert_eq!(
            ClientError::NotFound(ResourceKey::new("default", "x")).to_string(),
            "deployment default/x not found"
        );
    }
}
