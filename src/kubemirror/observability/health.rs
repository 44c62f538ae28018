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

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, message: impl Into<String>) -> Self {
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

/// Readiness used by `/readyz` and `/healthz`: the mirror is ready once its
/// initial listing has been applied.
pub fn readiness_report(cache_synced: bool) -> HealthReport {
    let component = if cache_synced {
        ComponentHealth::healthy("watch_cache")
    } else {
        ComponentHealth::unhealthy("watch_cache", "waiting for initial list")
    };
    let status = if component.healthy {
        HealthStatus::Ready
    } else {
        HealthStatus::Degraded
    };
    HealthReport {
        status,
        components: vec![component],
    }
}

/// Liveness only confirms the process is servicing requests.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth::healthy("process")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_tracks_cache_sync() {
        let pending = readiness_report(false);
        assert!(!pending.is_ready());
        let body = serde_json::to_value(&pending).expect("serialize");
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["components"][0]["error"], "waiting for initial list");

        assert!(readiness_report(true).is_ready());
        assert!(liveness_report().is_ready());
    }
}
