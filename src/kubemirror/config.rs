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

use crate::kubemirror::controller::manager::ManagerConfig;
use crate::kubemirror::controller::queue::QueueConfig;
use crate::kubemirror::controller::watch::WatchCacheConfig;
use crate::kubemirror::util::error::{new_error, BoxError};

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Enum for supported configuration parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Config {
    Namespace,
    Port,
    MetricsPort,
    Workers,
    ResyncPeriod,
    RelistPeriod,
    MaxRetries,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Namespace => "KUBEMIRROR_NAMESPACE",
            Config::Port => "KUBEMIRROR_PORT",
            Config::MetricsPort => "KUBEMIRROR_METRICS_PORT",
            Config::Workers => "KUBEMIRROR_WORKERS",
            Config::ResyncPeriod => "KUBEMIRROR_RESYNC_PERIOD",
            Config::RelistPeriod => "KUBEMIRROR_RELIST_PERIOD",
            Config::MaxRetries => "KUBEMIRROR_MAX_RETRIES",
        }
    }

    /// Default used when neither a flag nor the environment provides a value.
    /// `None` means the parameter is unset by default.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Config::Namespace => Some("default"),
            Config::Port => Some("8080"),
            Config::MetricsPort => Some("8081"),
            Config::Workers => Some("1"),
            Config::ResyncPeriod => Some("25s"),
            Config::RelistPeriod => Some("5m"),
            Config::MaxRetries => None,
        }
    }

    /// Returns the effective raw value, either from environment or default.
    pub fn raw(&self) -> Option<String> {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| self.default_value().map(str::to_string))
    }

    fn resolve_with<T>(
        &self,
        flag: Option<T>,
        parse: impl Fn(&str) -> Result<T, String>,
    ) -> Result<Option<T>, BoxError> {
        if flag.is_some() {
            return Ok(flag);
        }
        match self.raw() {
            Some(raw) => parse(&raw).map(Some).map_err(|err| {
                new_error(format!(
                    "invalid value '{raw}' for {}: {err}",
                    self.env_var()
                ))
            }),
            None => Ok(None),
        }
    }

    fn resolve<T>(&self, flag: Option<T>) -> Result<Option<T>, BoxError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.resolve_with(flag, |raw| raw.parse::<T>().map_err(|err| err.to_string()))
    }

    fn resolve_duration(&self, flag: Option<Duration>) -> Result<Option<Duration>, BoxError> {
        self.resolve_with(flag, |raw| {
            humantime::parse_duration(raw).map_err(|err| err.to_string())
        })
    }

    fn required<T>(&self, value: Option<T>) -> Result<T, BoxError> {
        value.ok_or_else(|| new_error(format!("{} has no value", self.env_var())))
    }
}

/// Values supplied on the command line. Anything left `None` falls back to
/// the environment and then to the default.
#[derive(Clone, Debug, Default)]
pub struct SettingsOverrides {
    pub namespace: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub workers: Option<usize>,
    pub resync_period: Option<Duration>,
    pub relist_period: Option<Duration>,
    pub max_retries: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    pub namespace: String,
    pub port: u16,
    pub metrics_port: u16,
    pub workers: usize,
    pub resync_period: Duration,
    pub relist_period: Duration,
    pub max_retries: Option<u32>,
}

impl ControllerSettings {
    /// Resolves every parameter with precedence flag > environment > default.
    pub fn resolve(overrides: SettingsOverrides) -> Result<Self, BoxError> {
        let namespace = Config::Namespace.required(Config::Namespace.resolve(overrides.namespace)?)?;
        let port = Config::Port.required(Config::Port.resolve(overrides.port)?)?;
        let metrics_port =
            Config::MetricsPort.required(Config::MetricsPort.resolve(overrides.metrics_port)?)?;
        let workers = Config::Workers.required(Config::Workers.resolve(overrides.workers)?)?;
        let resync_period = Config::ResyncPeriod
            .required(Config::ResyncPeriod.resolve_duration(overrides.resync_period)?)?;
        let relist_period = Config::RelistPeriod
            .required(Config::RelistPeriod.resolve_duration(overrides.relist_period)?)?;
        let max_retries = Config::MaxRetries.resolve(overrides.max_retries)?;

        if workers == 0 {
            return Err(new_error("worker count must be at least 1"));
        }
        if relist_period.is_zero() {
            return Err(new_error("relist period must be greater than zero"));
        }
        if port == metrics_port {
            return Err(new_error(format!(
                "query port and metrics port must differ (both {port})"
            )));
        }

        Ok(Self {
            namespace,
            port,
            metrics_port,
            workers,
            resync_period,
            relist_period,
            max_retries,
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            workers: self.workers,
            resync_period: self.resync_period,
            watch: WatchCacheConfig {
                relist_period: self.relist_period,
                ..WatchCacheConfig::default()
            },
            queue: QueueConfig {
                max_retries: self.max_retries,
                ..QueueConfig::default()
            },
        }
    }
}

/// Namespace used by one-shot commands that do not need the full settings.
pub fn namespace(flag: Option<String>) -> Result<String, BoxError> {
    Config::Namespace.required(Config::Namespace.resolve(flag)?)
}
