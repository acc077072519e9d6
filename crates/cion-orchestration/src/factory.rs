//! ---
//! cion_section: "05-networking-external-interfaces"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Orchestration cluster capability and HTTP backends."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Certificate, ClientBuilder, Identity, Response};
use tracing::debug;

use crate::docker::engine_base;
use crate::{
    ClientError, ClientFactory, ConnectionSpec, DockerEngineClient, KubernetesClient,
    OrchestrationClient, Result,
};

const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const MAX_ERROR_BODY: usize = 512;

/// Factory producing the HTTP backends for every connection mode.
#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory {
    default_timeout: Option<Duration>,
}

impl HttpClientFactory {
    /// Create a factory without a default request timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `timeout` to every client whose document does not set one.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn builder(&self, timeout: Option<Duration>) -> ClientBuilder {
        let builder = reqwest::Client::builder().use_rustls_tls();
        match timeout.or(self.default_timeout) {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(
        &self,
        environment: &str,
        spec: &ConnectionSpec,
    ) -> Result<Arc<dyn OrchestrationClient>> {
        match spec {
            ConnectionSpec::FromEnv { parameters } => {
                let host = std::env::var("DOCKER_HOST")
                    .unwrap_or_else(|_| DEFAULT_DOCKER_HOST.to_owned());
                let tls_verify = std::env::var("DOCKER_TLS_VERIFY")
                    .map(|value| !value.is_empty() && value != "0")
                    .unwrap_or(false);
                let mut builder = self.builder(parameters.timeout());
                if tls_verify {
                    let cert_dir = docker_cert_dir()?;
                    builder = with_client_identity(
                        builder,
                        &cert_dir.join("cert.pem"),
                        &cert_dir.join("key.pem"),
                        &cert_dir.join("ca.pem"),
                    )?;
                }
                let base = engine_base(&host, tls_verify)?;
                debug!(environment, endpoint = %base, tls = tls_verify, "docker client configured from environment");
                Ok(Arc::new(DockerEngineClient::new(
                    environment,
                    &base,
                    parameters.version.as_deref(),
                    build(builder)?,
                )))
            }
            ConnectionSpec::Tls {
                url,
                cert,
                key,
                ca,
                parameters,
            } => {
                let builder = with_client_identity(self.builder(parameters.timeout()), cert, key, ca)?;
                let base = engine_base(url, true)?;
                debug!(environment, endpoint = %base, "docker tls client configured");
                Ok(Arc::new(DockerEngineClient::new(
                    environment,
                    &base,
                    parameters.version.as_deref(),
                    build(builder)?,
                )))
            }
            ConnectionSpec::ServiceAccount {
                url,
                ca,
                token,
                namespace,
            } => {
                let builder = with_authorities(self.builder(None), ca)?;
                debug!(environment, endpoint = %url, namespace = %namespace, "kubernetes client configured");
                Ok(Arc::new(KubernetesClient::new(
                    environment,
                    url,
                    namespace.clone(),
                    token.clone(),
                    build(builder)?,
                )))
            }
        }
    }
}

fn docker_cert_dir() -> Result<PathBuf> {
    std::env::var_os("DOCKER_CERT_PATH")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".docker")))
        .ok_or_else(|| {
            ClientError::Configuration(
                "DOCKER_TLS_VERIFY is set but DOCKER_CERT_PATH is not and no home directory exists"
                    .to_owned(),
            )
        })
}

fn with_client_identity(
    builder: ClientBuilder,
    cert: &Path,
    key: &Path,
    ca: &Path,
) -> Result<ClientBuilder> {
    let mut pem = read_pem(cert)?;
    pem.push(b'\n');
    pem.extend(read_pem(key)?);
    let identity = Identity::from_pem(&pem).map_err(|err| {
        ClientError::Configuration(format!(
            "invalid client certificate {} / key {}: {err}",
            cert.display(),
            key.display()
        ))
    })?;
    with_authorities(builder.identity(identity), ca)
}

/// Trust every certificate in the PEM bundle at `ca`.
///
/// A bundle without a single certificate is refused here rather than at the
/// first handshake.
fn with_authorities(builder: ClientBuilder, ca: &Path) -> Result<ClientBuilder> {
    let invalid = |reason: String| {
        ClientError::Configuration(format!("invalid CA {}: {reason}", ca.display()))
    };
    let authorities =
        Certificate::from_pem_bundle(&read_pem(ca)?).map_err(|err| invalid(err.to_string()))?;
    if authorities.is_empty() {
        return Err(invalid("no PEM certificate found".to_owned()));
    }
    Ok(authorities
        .into_iter()
        .fold(builder, ClientBuilder::add_root_certificate))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| ClientError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn build(builder: ClientBuilder) -> Result<reqwest::Client> {
    builder
        .build()
        .map_err(|err| ClientError::Configuration(format!("unable to build http client: {err}")))
}

/// Turn non-success responses into [`ClientError::Status`].
pub(crate) async fn expect_success(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        operation: operation.to_owned(),
        status: status.as_u16(),
        body: body.trim().chars().take(MAX_ERROR_BODY).collect(),
    })
}
