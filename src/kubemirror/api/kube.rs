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

//! HTTP implementation of [`ResourceClient`] against the Kubernetes REST API.

use super::client::{ClientError, ResourceClient, ResourceList, VersionToken, WatchEvent, WatchStream};
use crate::kubemirror::k8s::deployment::{Deployment, DeploymentList};
use crate::kubemirror::k8s::store::ResourceKey;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{stream, Stream, StreamExt};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::x509::X509;
use reqwest::{Certificate, Client, Identity, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WATCH_TIMEOUT_SECONDS: u64 = 300;
const LIST_PAGE_SIZE: u32 = 500;
const MAX_WATCH_LINE_BYTES: usize = 16 * 1024 * 1024;
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Where connection settings come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientSource {
    /// Explicit kubeconfig path, else `KUBECONFIG`, else `~/.kube/config`.
    Kubeconfig(Option<PathBuf>),
    InCluster,
}

#[derive(Deserialize)]
struct KubeConfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: Option<String>,
}

#[derive(Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Deserialize, Default)]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<String>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-certificate")]
    client_certificate: Option<String>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
    #[serde(rename = "client-key")]
    client_key: Option<String>,
}

#[derive(Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: String,
}

/// Connection settings resolved from a kubeconfig or the pod environment.
#[derive(Clone, Default)]
pub struct ConnectionConfig {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub token: Option<String>,
    pub client_certificate_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("server", &self.server)
            .field("ca", &self.ca_pem.is_some())
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("client_certificate", &self.client_certificate_pem.is_some())
            .finish()
    }
}

fn config_error(message: impl Into<String>) -> ClientError {
    ClientError::Config(message.into())
}

fn default_kubeconfig_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var("KUBECONFIG") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    let home = env::var("HOME").map_err(|_| config_error("HOME environment variable is not set"))?;
    Ok(PathBuf::from(home).join(".kube").join("config"))
}

fn resolve_path(path: &str, base_dir: &Path) -> PathBuf {
    let trimmed = path.trim();
    let expanded = match (trimmed.strip_prefix("~/"), env::var("HOME")) {
        (Some(stripped), Ok(home)) => PathBuf::from(home).join(stripped),
        _ => PathBuf::from(trimmed),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// Reads a `*-data` field (base64) or its file-path sibling.
fn read_resolved_data(
    data_field: Option<&String>,
    path_field: Option<&String>,
    config_dir: &Path,
    field_name: &str,
) -> Result<Option<Vec<u8>>, ClientError> {
    if let Some(raw) = data_field.map(|raw| raw.trim()).filter(|raw| !raw.is_empty()) {
        let bytes = BASE64
            .decode(raw)
            .map_err(|_| config_error(format!("failed to decode base64 for {field_name}")))?;
        return Ok(Some(bytes));
    }

    if let Some(path) = path_field {
        let resolved = resolve_path(path, config_dir);
        let bytes = fs::read(&resolved).map_err(|err| {
            config_error(format!(
                "failed to read {field_name} from {}: {err}",
                resolved.display()
            ))
        })?;
        return Ok(Some(bytes));
    }

    Ok(None)
}

impl ConnectionConfig {
    /// Resolves the current context of a kubeconfig file.
    pub fn from_kubeconfig(path: Option<&Path>) -> Result<Self, ClientError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_kubeconfig_path()?,
        };
        let raw = fs::read_to_string(&path).map_err(|err| {
            config_error(format!("failed to read kubeconfig {}: {err}", path.display()))
        })?;
        let config: KubeConfig = serde_yaml::from_str(&raw).map_err(|err| {
            config_error(format!("failed to parse kubeconfig {}: {err}", path.display()))
        })?;
        let config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let context = match config.current_context.as_deref() {
            Some(name) => config
                .contexts
                .iter()
                .find(|ctx| ctx.name == name)
                .ok_or_else(|| config_error(format!("context '{name}' not found in kubeconfig")))?,
            None => config
                .contexts
                .first()
                .ok_or_else(|| config_error("kubeconfig does not define any contexts"))?,
        };
        let cluster = config
            .clusters
            .iter()
            .find(|cluster| cluster.name == context.context.cluster)
            .ok_or_else(|| {
                config_error(format!(
                    "cluster '{}' not found in kubeconfig",
                    context.context.cluster
                ))
            })?;
        let user = config
            .users
            .iter()
            .find(|user| user.name == context.context.user)
            .map(|user| &user.user);

        let ca_pem = read_resolved_data(
            cluster.cluster.certificate_authority_data.as_ref(),
            cluster.cluster.certificate_authority.as_ref(),
            &config_dir,
            "certificate-authority",
        )?;

        let mut resolved = ConnectionConfig {
            server: cluster.cluster.server.clone(),
            ca_pem,
            insecure_skip_tls_verify: cluster.cluster.insecure_skip_tls_verify,
            ..Default::default()
        };

        if let Some(user) = user {
            resolved.token = match (&user.token, &user.token_file) {
                (Some(token), _) => Some(token.trim().to_string()),
                (None, Some(file)) => {
                    let path = resolve_path(file, &config_dir);
                    let token = fs::read_to_string(&path).map_err(|err| {
                        config_error(format!("failed to read token file {}: {err}", path.display()))
                    })?;
                    Some(token.trim().to_string())
                }
                (None, None) => None,
            };
            resolved.client_certificate_pem = read_resolved_data(
                user.client_certificate_data.as_ref(),
                user.client_certificate.as_ref(),
                &config_dir,
                "client-certificate",
            )?;
            resolved.client_key_pem = read_resolved_data(
                user.client_key_data.as_ref(),
                user.client_key.as_ref(),
                &config_dir,
                "client-key",
            )?;
        }

        Ok(resolved)
    }

    /// Uses the service account mounted into every pod.
    pub fn in_cluster() -> Result<Self, ClientError> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| config_error("KUBERNETES_SERVICE_HOST is not set; not running in a cluster"))?;
        let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = fs::read_to_string(dir.join("token"))
            .map_err(|err| config_error(format!("failed to read service account token: {err}")))?;
        let ca_pem = fs::read(dir.join("ca.crt"))
            .map_err(|err| config_error(format!("failed to read service account CA: {err}")))?;

        Ok(ConnectionConfig {
            server: format!("https://{host}:{port}"),
            ca_pem: Some(ca_pem),
            token: Some(token.trim().to_string()),
            ..Default::default()
        })
    }
}

fn build_reqwest_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity, String> {
    let cert = X509::from_pem(cert_pem)
        .map_err(|err| format!("failed to parse client certificate: {err}"))?;
    let key = PKey::private_key_from_pem(key_pem)
        .map_err(|err| format!("failed to parse client key: {err}"))?;
    let pkcs12 = Pkcs12::builder()
        .name("kubemirror-client")
        .pkey(&key)
        .cert(&cert)
        .build2("")
        .map_err(|err| format!("failed to build client PKCS#12 bundle: {err}"))?;
    let pkcs12_der = pkcs12
        .to_der()
        .map_err(|err| format!("failed to encode client PKCS#12 bundle: {err}"))?;
    Identity::from_pkcs12_der(&pkcs12_der, "")
        .map_err(|err| format!("failed to load client identity: {err}"))
}

/// Error body returned by the API server (`kind: Status`).
#[derive(Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<u16>,
}

fn transport_error(err: reqwest::Error) -> ClientError {
    if err.is_decode() {
        ClientError::Decode(err.to_string())
    } else if err.is_builder() {
        ClientError::Config(err.to_string())
    } else {
        ClientError::Transport(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &str, key: Option<&ResourceKey>) -> ClientError {
    let message = serde_json::from_str::<StatusBody>(body)
        .ok()
        .and_then(|parsed| parsed.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.trim().to_string()
            }
        });

    match (status, key) {
        (StatusCode::GONE, _) => ClientError::Expired(message),
        (StatusCode::NOT_FOUND, Some(key)) => ClientError::NotFound(key.clone()),
        _ => ClientError::Status {
            code: status.as_u16(),
            message,
        },
    }
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: Value,
}

fn parse_watch_line(line: &[u8]) -> Result<Option<WatchEvent>, ClientError> {
    let text = std::str::from_utf8(line)
        .map_err(|err| ClientError::Decode(err.to_string()))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }
    let raw: RawWatchEvent =
        serde_json::from_str(text).map_err(|err| ClientError::Decode(err.to_string()))?;
    let decode = |object: Value| {
        serde_json::from_value::<Deployment>(object).map_err(|err| ClientError::Decode(err.to_string()))
    };

    let event = match raw.event_type.as_str() {
        "ADDED" => WatchEvent::Added(decode(raw.object)?),
        "MODIFIED" => WatchEvent::Modified(decode(raw.object)?),
        "DELETED" => WatchEvent::Deleted(decode(raw.object)?),
        "BOOKMARK" => {
            let version = raw
                .object
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .unwrap_or_default();
            WatchEvent::Bookmark(VersionToken::new(version))
        }
        "ERROR" => {
            let status: StatusBody = serde_json::from_value(raw.object)
                .map_err(|err| ClientError::Decode(err.to_string()))?;
            let message = status.message.unwrap_or_default();
            return Err(match status.code {
                Some(410) => ClientError::Expired(message),
                Some(code) => ClientError::Status { code, message },
                None => ClientError::Status { code: 500, message },
            });
        }
        other => {
            return Err(ClientError::Decode(format!(
                "unknown watch event type '{other}'"
            )))
        }
    };
    Ok(Some(event))
}

struct LineDecoder<S> {
    inner: S,
    buffer: Vec<u8>,
    max_line: usize,
    finished: bool,
}

/// Splits a chunked body into newline-delimited watch events. The stream ends
/// after the first error.
pub fn decode_watch_stream<S, B, E>(body: S) -> WatchStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    decode_watch_stream_with_limit(body, MAX_WATCH_LINE_BYTES)
}

/// Like [`decode_watch_stream`], failing with a decode error once a line
/// grows past `max_line` bytes without a newline.
pub fn decode_watch_stream_with_limit<S, B, E>(body: S, max_line: usize) -> WatchStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = LineDecoder {
        inner: Box::pin(body),
        buffer: Vec::new(),
        max_line,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match parse_watch_line(&line) {
                    Ok(None) => continue,
                    Ok(Some(event)) => return Some((Ok(event), state)),
                    Err(err) => {
                        state.finished = true;
                        state.buffer.clear();
                        return Some((Err(err), state));
                    }
                }
            }
            if state.finished {
                return None;
            }
            if state.buffer.len() > state.max_line {
                let len = state.buffer.len();
                state.finished = true;
                state.buffer = Vec::new();
                return Some((
                    Err(ClientError::Decode(format!(
                        "watch event exceeds {} bytes (buffered {len})",
                        state.max_line
                    ))),
                    state,
                ));
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    state.finished = true;
                    state.buffer.clear();
                    return Some((Err(ClientError::Transport(err.to_string())), state));
                }
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    return match parse_watch_line(&rest) {
                        Ok(Some(event)) => Some((Ok(event), state)),
                        Ok(None) => None,
                        Err(err) => Some((Err(err), state)),
                    };
                }
            }
        }
    }))
}

/// Namespace-scoped Deployment client.
pub struct KubeClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    namespace: String,
}

impl KubeClient {
    pub fn new(source: &ClientSource, namespace: &str) -> Result<Self, ClientError> {
        let config = match source {
            ClientSource::Kubeconfig(path) => ConnectionConfig::from_kubeconfig(path.as_deref())?,
            ClientSource::InCluster => ConnectionConfig::in_cluster()?,
        };
        Self::from_config(config, namespace)
    }

    pub fn from_config(config: ConnectionConfig, namespace: &str) -> Result<Self, ClientError> {
        let base_url = Url::parse(&config.server)
            .map_err(|err| config_error(format!("invalid server URL '{}': {err}", config.server)))?;
        if base_url.cannot_be_a_base() {
            return Err(config_error(format!(
                "server URL '{}' cannot be used as a base",
                config.server
            )));
        }

        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(ca) = config.ca_pem.as_ref() {
            let certificate = Certificate::from_pem(ca)
                .map_err(|err| config_error(format!("invalid certificate authority: {err}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let (Some(cert), Some(key)) = (
            config.client_certificate_pem.as_ref(),
            config.client_key_pem.as_ref(),
        ) {
            let identity = build_reqwest_identity(cert, key).map_err(|err| {
                config_error(format!("kubeconfig contains malformed client identity: {err}"))
            })?;
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|err| config_error(format!("failed to construct HTTP client: {err}")))?;

        Ok(KubeClient {
            client,
            base_url,
            token: config.token.filter(|token| !token.is_empty()),
            namespace: namespace.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn url_from_segments(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut parts) = url.path_segments_mut() {
            parts.pop_if_empty();
            for segment in segments {
                parts.push(segment);
            }
        }
        url
    }

    fn collection_url(&self, namespace: &str) -> Url {
        self.url_from_segments(&["apis", "apps", "v1", "namespaces", namespace, "deployments"])
    }

    fn object_url(&self, key: &ResourceKey) -> Url {
        self.url_from_segments(&[
            "apis",
            "apps",
            "v1",
            "namespaces",
            &key.namespace,
            "deployments",
            &key.name,
        ])
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(reqwest::header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        self.authorize(request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn handle_json<T>(
        &self,
        response: Response,
        key: Option<&ResourceKey>,
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|err| ClientError::Decode(err.to_string()));
        }
        Err(status_error(status, &String::from_utf8_lossy(&body), key))
    }
}

#[async_trait]
impl ResourceClient for KubeClient {
    async fn list(&self) -> Result<ResourceList, ClientError> {
        let mut items = Vec::new();
        let mut continue_token: Option<String> = None;
        loop {
            let mut url = self.collection_url(&self.namespace);
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("limit", &LIST_PAGE_SIZE.to_string());
                if let Some(token) = continue_token.as_deref() {
                    query.append_pair("continue", token);
                }
            }
            let response = self.send(self.client.get(url)).await?;
            let page: DeploymentList = self.handle_json(response, None).await?;
            items.extend(page.items);
            match page.metadata.continue_token.filter(|token| !token.is_empty()) {
                Some(next) => continue_token = Some(next),
                None => {
                    let version = page.metadata.resource_version.unwrap_or_default();
                    return Ok(ResourceList {
                        items,
                        version: VersionToken::new(version),
                    });
                }
            }
        }
    }

    async fn watch(&self, from: &VersionToken) -> Result<WatchStream, ClientError> {
        let mut url = self.collection_url(&self.namespace);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("watch", "true");
            query.append_pair("allowWatchBookmarks", "true");
            query.append_pair("timeoutSeconds", &WATCH_TIMEOUT_SECONDS.to_string());
            if !from.is_empty() {
                query.append_pair("resourceVersion", from.as_str());
            }
        }
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, None));
        }
        Ok(decode_watch_stream(response.bytes_stream()))
    }

    async fn get(&self, key: &ResourceKey) -> Result<Deployment, ClientError> {
        let response = self.send(self.client.get(self.object_url(key))).await?;
        self.handle_json(response, Some(key)).await
    }

    async fn create(&self, record: &Deployment) -> Result<Deployment, ClientError> {
        let url = self.collection_url(&record.namespace());
        let response = self.send(self.client.post(url).json(record)).await?;
        self.handle_json(response, None).await
    }

    async fn update(&self, record: &Deployment) -> Result<Deployment, ClientError> {
        let key = record.key();
        let response = self
            .send(self.client.put(self.object_url(&key)).json(record))
            .await?;
        self.handle_json(response, Some(&key)).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClientError> {
        let response = self.send(self.client.delete(self.object_url(key))).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body, Some(key)))
    }
}
