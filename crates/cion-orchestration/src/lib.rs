//! ---
//! cion_section: "05-networking-external-interfaces"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Orchestration cluster capability and HTTP backends."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Orchestration capability consumed by the worker.
//!
//! Every configured environment owns exactly one [`OrchestrationClient`]. The
//! concrete implementation is chosen from the environment's connection mode
//! by a [`ClientFactory`] when the environment document is parsed; the worker
//! itself only ever talks to the trait.

#![warn(missing_docs)]

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

pub mod docker;
pub mod error;
pub mod factory;
pub mod kubernetes;

pub use docker::DockerEngineClient;
pub use error::ClientError;
pub use factory::HttpClientFactory;
pub use kubernetes::KubernetesClient;

/// Shared result type for orchestration calls.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Capability exposed by every deployment target.
#[async_trait]
pub trait OrchestrationClient: Send + Sync + fmt::Debug {
    /// Short backend label used in logs (`docker`, `kubernetes`, ...).
    fn backend(&self) -> &'static str;

    /// Authenticate against the image registry on behalf of this environment.
    async fn login(&self, credentials: &Credentials) -> Result<()>;

    /// Names of the services (or deployments) currently running in the environment.
    async fn list_service_names(&self) -> Result<BTreeSet<String>>;

    /// Pull `image` and roll it out to `service`.
    async fn pull_and_update(&self, service: &str, image: &str) -> Result<()>;
}

/// Builds orchestration clients from parsed connection settings.
pub trait ClientFactory: Send + Sync + fmt::Debug {
    /// Construct the client for `environment`. Must not perform network I/O.
    fn connect(
        &self,
        environment: &str,
        spec: &ConnectionSpec,
    ) -> Result<Arc<dyn OrchestrationClient>>;
}

/// Registry credentials loaded from a repository policy's login file.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Registry user name.
    pub username: String,
    /// Registry password or token.
    pub password: String,
    /// Optional registry address; the daemon default registry when absent.
    #[serde(default)]
    pub registry: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("registry", &self.registry)
            .finish()
    }
}

/// Optional tuning knobs shared by the Docker backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientParameters {
    /// Docker Engine API version to pin (e.g. `1.41`).
    #[serde(default)]
    pub version: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl ClientParameters {
    /// Request timeout as a [`Duration`], if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Connection settings for one environment, selected by its `mode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    /// Docker client configured from `DOCKER_HOST` and friends.
    FromEnv {
        /// Client parameters from the environment document.
        parameters: ClientParameters,
    },
    /// Docker client authenticated with a mutual-TLS client certificate.
    Tls {
        /// Engine endpoint (`tcp://` or `https://`).
        url: String,
        /// Client certificate (PEM).
        cert: PathBuf,
        /// Client private key (PEM).
        key: PathBuf,
        /// Certificate authority used to verify the engine (PEM).
        ca: PathBuf,
        /// Client parameters from the environment document.
        parameters: ClientParameters,
    },
    /// Kubernetes API server authenticated with a service-account token.
    ServiceAccount {
        /// API server endpoint.
        url: String,
        /// Certificate authority used to verify the API server (PEM).
        ca: PathBuf,
        /// Decoded bearer token.
        token: String,
        /// Namespace holding the deployments.
        namespace: String,
    },
}

impl ConnectionSpec {
    /// Document `mode` value that selects this variant.
    pub fn mode(&self) -> &'static str {
        match self {
            ConnectionSpec::FromEnv { .. } => "from_env",
            ConnectionSpec::Tls { .. } => "tls",
            ConnectionSpec::ServiceAccount { .. } => "k8s_serviceaccount",
        }
    }
}

/// Split `repo[:tag]` into its repository and tag, defaulting the tag to `latest`.
///
/// Only a colon after the last `/` separates a tag, so registry ports such as
/// `registry:5000/app` are kept in the repository.
pub fn split_reference(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(offset) => {
            let split = name_start + offset;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

/// Registry images without an explicit registry host are pulled from.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Registry host of an image reference.
///
/// The first path component names a registry only when it looks like a host
/// (`registry.acme.example`, `registry:5000`, `localhost`); everything else,
/// including `acme/widgets`, comes from [`DEFAULT_REGISTRY`].
pub fn image_registry(image: &str) -> &str {
    match image.split_once('/') {
        Some(("index.docker.io" | "registry-1.docker.io", _)) => DEFAULT_REGISTRY,
        Some((first, _)) if first.contains(['.', ':']) || first == "localhost" => first,
        _ => DEFAULT_REGISTRY,
    }
}
