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


use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::kubemirror::api::client::ResourceClient;
use crate::kubemirror::api::kube::KubeClient;
use crate::kubemirror::cli::args::ServerArgs;
use crate::kubemirror::config::ControllerSettings;
use crate::kubemirror::controller::lister::DeploymentLister;
use crate::kubemirror::controller::manager::ControllerManager;
use crate::kubemirror::controller::reconcile::DeploymentReconciler;
use crate::kubemirror::logger::{log_info, log_warn};
use crate::kubemirror::observability::tracing;
use crate::kubemirror::server;
use crate::kubemirror::util::error::{with_context, BoxError};

/// How soon a rollout still in progress is looked at again.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

pub(super) async fn handle_server(args: &ServerArgs) -> Result<(), BoxError> {
    tracing::init();
    let settings = ControllerSettings::resolve(args.overrides())?;

    let client = KubeClient::new(&args.cluster.source(), &settings.namespace)
        .map_err(|e| with_context(e, "Failed to build Kubernetes client"))?;
    let client: Arc<dyn ResourceClient> = Arc::new(client);
    let reconciler = Arc::new(DeploymentReconciler::new(client.clone(), PROGRESS_INTERVAL));
    let manager = ControllerManager::new(client, reconciler, settings.manager_config());
    let lister: Arc<dyn DeploymentLister> = manager.cache();

    let query_listener = server::bind(SocketAddr::from(([0, 0, 0, 0], settings.port))).await?;
    let metrics_listener =
        server::bind(SocketAddr::from(([0, 0, 0, 0], settings.metrics_port))).await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        log_info("server", "Shutdown signal received", &[]);
        signal_cancel.cancel();
    });

    let workers = settings.workers.to_string();
    log_info(
        "server",
        "Starting deployment mirror",
        &[
            ("namespace", settings.namespace.as_str()),
            ("workers", workers.as_str()),
        ],
    );

    let controller = async {
        let result = manager.run(cancel.clone()).await;
        cancel.cancel();
        result
    };
    let (controller, query, metrics) = tokio::join!(
        controller,
        cancel_on_error(
            server::serve(
                "query",
                query_listener,
                server::build_router(lister.clone()),
                cancel.clone(),
            ),
            &cancel,
        ),
        cancel_on_error(
            server::serve(
                "metrics",
                metrics_listener,
                server::build_metrics_router(lister),
                cancel.clone(),
            ),
            &cancel,
        ),
    );

    controller.map_err(|e| with_context(e, "Deployment informer failed"))?;
    query?;
    metrics?;
    Ok(())
}

/// Stops the sibling tasks when `task` fails.
async fn cancel_on_error<T, E>(
    task: impl Future<Output = Result<T, E>>,
    cancel: &CancellationToken,
) -> Result<T, E> {
    let result = task.await;
    if result.is_err() {
        cancel.cancel();
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log_warn(
                "server",
                "Failed to listen for Ctrl-C",
                &[("error", err.to_string().as_str())],
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
