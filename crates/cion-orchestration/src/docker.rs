//! ---
//! cion_section: "05-networking-external-interfaces"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Docker Engine API backend for swarm environments."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use parking_lot::RwLock;
use reqwest::RequestBuilder;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::factory::expect_success;
use crate::{
    image_registry, split_reference, ClientError, Credentials, OrchestrationClient, Result,
    DEFAULT_REGISTRY,
};

const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

/// Docker Engine client driving swarm services over the HTTP API.
///
/// A successful [`login`](OrchestrationClient::login) caches the auth header
/// of the registry it was made against. Pulls and service updates only carry
/// the header cached for the registry of the image they deploy.
#[derive(Debug)]
pub struct DockerEngineClient {
    environment: String,
    base: String,
    http: reqwest::Client,
    registry_auth: RwLock<BTreeMap<String, String>>,
}

impl DockerEngineClient {
    /// Create a client for an engine reachable at `base` (already normalised).
    pub fn new(
        environment: impl Into<String>,
        base: &Url,
        api_version: Option<&str>,
        http: reqwest::Client,
    ) -> Self {
        let mut base = base.as_str().trim_end_matches('/').to_owned();
        if let Some(version) = api_version {
            base.push_str("/v");
            base.push_str(version.trim_start_matches('v'));
        }
        Self {
            environment: environment.into(),
            base,
            http,
            registry_auth: RwLock::new(BTreeMap::new()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn with_auth(&self, request: RequestBuilder, repository: &str) -> RequestBuilder {
        let registry = image_registry(repository);
        match self.registry_auth.read().get(registry) {
            Some(auth) => request.header(REGISTRY_AUTH_HEADER, auth.as_str()),
            None => request,
        }
    }

    async fn pull(&self, repository: &str, tag: &str) -> Result<String> {
        let operation = format!("pull {repository}:{tag}");
        let request = self
            .http
            .post(self.endpoint("/images/create"))
            .query(&[("fromImage", repository), ("tag", tag)]);
        let response = self
            .with_auth(request, repository)
            .send()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;
        let response = expect_success(response, &operation).await?;
        // The engine streams progress as JSON lines and reports failures in-band.
        let progress = response
            .text()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;
        for line in progress.lines().filter(|line| !line.trim().is_empty()) {
            if let Ok(event) = serde_json::from_str::<Value>(line) {
                if let Some(error) = event.get("error").and_then(Value::as_str) {
                    return Err(ClientError::protocol(&operation, error));
                }
            }
        }

        let operation = format!("inspect {repository}:{tag}");
        let response = self
            .http
            .get(self.endpoint(&format!("/images/{repository}:{tag}/json")))
            .send()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;
        let inspect: Value = expect_success(response, &operation)
            .await?
            .json()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;
        let pinned = inspect
            .get("RepoDigests")
            .and_then(Value::as_array)
            .and_then(|digests| digests.first())
            .or_else(|| inspect.get("Id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::protocol(&operation, "image has neither digest nor id"))?;
        Ok(pinned.to_owned())
    }
}

#[async_trait]
impl OrchestrationClient for DockerEngineClient {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn login(&self, credentials: &Credentials) -> Result<()> {
        let operation = format!("login {}", credentials.username);
        let mut auth = json!({
            "username": credentials.username,
            "password": credentials.password,
        });
        if let Some(registry) = &credentials.registry {
            auth["serveraddress"] = json!(registry);
        }
        let response = self
            .http
            .post(self.endpoint("/auth"))
            .json(&auth)
            .send()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;
        expect_success(response, &operation).await?;

        let registry = credentials
            .registry
            .as_deref()
            .map(registry_host)
            .unwrap_or(DEFAULT_REGISTRY)
            .to_owned();
        debug!(
            environment = %self.environment,
            username = %credentials.username,
            registry = %registry,
            "registry login accepted"
        );
        self.registry_auth
            .write()
            .insert(registry, URL_SAFE.encode(auth.to_string()));
        Ok(())
    }

    async fn list_service_names(&self) -> Result<BTreeSet<String>> {
        let operation = "list services";
        let response = self
            .http
            .get(self.endpoint("/services"))
            .send()
            .await
            .map_err(|err| ClientError::http(operation, err))?;
        let services: Vec<Value> = expect_success(response, operation)
            .await?
            .json()
            .await
            .map_err(|err| ClientError::http(operation, err))?;
        Ok(services
            .iter()
            .filter_map(|service| service.pointer("/Spec/Name").and_then(Value::as_str))
            .map(str::to_owned)
            .collect())
    }

    async fn pull_and_update(&self, service: &str, image: &str) -> Result<()> {
        let (repository, tag) = split_reference(image);
        let pinned = self.pull(repository, tag).await?;
        debug!(environment = %self.environment, image, pinned = %pinned, "image pulled");

        let operation = format!("inspect service {service}");
        let response = self
            .http
            .get(self.endpoint(&format!("/services/{service}")))
            .send()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::ServiceNotFound(service.to_owned()));
        }
        let current: Value = expect_success(response, &operation)
            .await?
            .json()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;

        let id = current
            .get("ID")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::protocol(&operation, "missing service ID"))?
            .to_owned();
        let version = current
            .pointer("/Version/Index")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::protocol(&operation, "missing service version"))?;
        // Keep the full existing spec; only the container image changes.
        let mut spec = current
            .get("Spec")
            .cloned()
            .ok_or_else(|| ClientError::protocol(&operation, "missing service spec"))?;
        let container = spec
            .pointer_mut("/TaskTemplate/ContainerSpec")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ClientError::protocol(&operation, "service has no container spec"))?;
        container.insert("Image".to_owned(), Value::String(pinned.clone()));

        let operation = format!("update service {service}");
        let request = self
            .http
            .post(self.endpoint(&format!("/services/{id}/update")))
            .query(&[("version", version)])
            .json(&spec);
        let response = self
            .with_auth(request, repository)
            .send()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;
        expect_success(response, &operation).await?;

        info!(environment = %self.environment, service, image = %pinned, "swarm service updated");
        Ok(())
    }
}

/// Registry host named by a login `serveraddress`.
///
/// Accepts bare hosts as well as URLs such as `https://index.docker.io/v1/`;
/// every Docker Hub alias maps to [`DEFAULT_REGISTRY`].
fn registry_host(address: &str) -> &str {
    let address = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    let host = address.split('/').next().unwrap_or(address);
    match host {
        "" | "index.docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY,
        host => host,
    }
}

/// Normalise a Docker endpoint (`tcp://host:port`) into an HTTP(S) base URL.
pub(crate) fn engine_base(endpoint: &str, tls: bool) -> Result<Url> {
    let scheme = if tls { "https" } else { "http" };
    let normalised = match endpoint.strip_prefix("tcp://") {
        Some(rest) => format!("{scheme}://{rest}"),
        None => endpoint.to_owned(),
    };
    let url = Url::parse(&normalised).map_err(|err| {
        ClientError::Configuration(format!("invalid docker endpoint '{endpoint}': {err}"))
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClientError::Configuration(format!(
            "docker endpoint scheme '{other}' is not supported; expose the engine over tcp"
        ))),
    }
}
