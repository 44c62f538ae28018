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

use super::watch::WatchCache;

/// Read-only view served to external readers.
pub trait DeploymentLister: Send + Sync {
    /// Names currently mirrored, sorted lexicographically. Never blocks on
    /// sync: before the first listing this is whatever has arrived so far.
    fn list_names(&self) -> Vec<String>;

    fn has_synced(&self) -> bool;
}

impl DeploymentLister for WatchCache {
    fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .snapshot()
            .iter()
            .map(|record| record.name().to_string())
            .collect();
        names.sort();
        names
    }

    fn has_synced(&self) -> bool {
        WatchCache::has_synced(self)
    }
}
