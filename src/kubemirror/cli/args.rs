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


use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::kubemirror::api::kube::ClientSource;
use crate::kubemirror::config::SettingsOverrides;
use crate::kubemirror::logger::{LevelFilter, LogFormat, LogLevel};

/// Mirror Kubernetes Deployments into a local cache and serve their names.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct KubeMirror {
    /// Minimum log level to emit
    #[arg(long, global = true, value_enum, default_value_t = LogLevelArg::Info)]
    pub log_level: LogLevelArg,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Json)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the deployment mirror with its query and metrics servers
    Server(ServerArgs),

    /// List deployment names once and exit
    List(ListArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Json,
    #[value(alias = "console")]
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    None,
}

impl From<LogLevelArg> for LevelFilter {
    fn from(value: LogLevelArg) -> Self {
        match value {
            LogLevelArg::Trace => LevelFilter::Level(LogLevel::Trace),
            LogLevelArg::Debug => LevelFilter::Level(LogLevel::Debug),
            LogLevelArg::Info => LevelFilter::Level(LogLevel::Info),
            LogLevelArg::Warn => LevelFilter::Level(LogLevel::Warn),
            LogLevelArg::Error => LevelFilter::Level(LogLevel::Error),
            LogLevelArg::None => LevelFilter::None,
        }
    }
}

#[derive(Args, Clone, Debug, Default)]
pub struct ClusterArgs {
    /// Path to a kubeconfig file (defaults to $KUBECONFIG, then ~/.kube/config)
    #[arg(long, conflicts_with = "in_cluster")]
    pub kubeconfig: Option<PathBuf>,

    /// Use the pod's service account instead of a kubeconfig
    #[arg(long)]
    pub in_cluster: bool,

    /// Namespace to mirror
    #[arg(long, short = 'n')]
    pub namespace: Option<String>,
}

impl ClusterArgs {
    pub fn source(&self) -> ClientSource {
        if self.in_cluster {
            ClientSource::InCluster
        } else {
            ClientSource::Kubeconfig(self.kubeconfig.clone())
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct ServerArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Port for the query server
    #[arg(long)]
    pub port: Option<u16>,

    /// Port for /metrics and the health endpoints
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Number of concurrent reconcile workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Interval between full re-enqueues of every cached key (e.g. 25s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub resync_period: Option<Duration>,

    /// Interval between unconditional relists (e.g. 5m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub relist_period: Option<Duration>,

    /// Failed attempts after which a key is dropped (unbounded when unset)
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl ServerArgs {
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            namespace: self.cluster.namespace.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            workers: self.workers,
            resync_period: self.resync_period,
            relist_period: self.relist_period,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
}
