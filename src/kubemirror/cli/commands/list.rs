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


use std::fmt::Write;

use crate::kubemirror::api::client::ResourceClient;
use crate::kubemirror::api::kube::KubeClient;
use crate::kubemirror::cli::args::ListArgs;
use crate::kubemirror::config;
use crate::kubemirror::k8s::deployment::Deployment;
use crate::kubemirror::util::error::{with_context, BoxError};

pub(super) async fn handle_list(args: &ListArgs) -> Result<(), BoxError> {
    let namespace = config::namespace(args.cluster.namespace.clone())?;
    let client = KubeClient::new(&args.cluster.source(), &namespace)
        .map_err(|e| with_context(e, "Failed to build Kubernetes client"))?;
    let listing = client.list().await.map_err(|e| {
        with_context(
            e,
            format!("Failed to list deployments in namespace '{namespace}'"),
        )
    })?;
    print!("{}", render_listing(&namespace, &listing.items));
    Ok(())
}

fn render_listing(namespace: &str, items: &[Deployment]) -> String {
    let mut names: Vec<&str> = items.iter().map(Deployment::name).collect();
    names.sort_unstable();
    let mut output = format!(
        "Found {} deployments in '{}' namespace:\n",
        names.len(),
        namespace
    );
    for name in names {
        let _ = writeln!(output, "- {name}");
    }
    output
}
