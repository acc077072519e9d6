//! ---
//! cion_section: "01-core-functionality"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Image routing, update dispatch and worker lifecycle."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use cion_config::ConfigSnapshot;
use cion_orchestration::{ClientError, Credentials};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures of a single update. Nothing is retried.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("credential file {path:?} is unreadable or malformed: {reason}")]
    CredentialFile { path: PathBuf, reason: String },
    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),
    #[error("registry login on environment '{environment}' failed")]
    LoginFailed {
        environment: String,
        #[source]
        source: ClientError,
    },
    #[error("updating service '{service}' on environment '{environment}' failed")]
    UpdateFailed {
        environment: String,
        service: String,
        #[source]
        source: ClientError,
    },
    #[error("listing services of environment '{environment}' failed")]
    ListFailed {
        environment: String,
        #[source]
        source: ClientError,
    },
    #[error("worker is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// Stable label for metrics and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::CredentialFile { .. } => "credential_file",
            DispatchError::UnknownEnvironment(_) => "unknown_environment",
            DispatchError::LoginFailed { .. } => "login_failed",
            DispatchError::UpdateFailed { .. } => "update_failed",
            DispatchError::ListFailed { .. } => "list_failed",
            DispatchError::ShuttingDown => "shutting_down",
        }
    }
}

/// Read registry credentials from a JSON login file.
pub async fn load_credentials(path: &Path) -> Result<Credentials, DispatchError> {
    let failed = |reason: String| DispatchError::CredentialFile {
        path: path.to_path_buf(),
        reason,
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| failed(err.to_string()))?;
    serde_json::from_str(&raw).map_err(|err| failed(err.to_string()))
}

/// Roll `service` on `environment` to `image`.
///
/// When the image's repository policy names a login file, the credentials
/// are loaded and handed to the environment's client before the update.
pub async fn update(
    snapshot: &ConfigSnapshot,
    environment: &str,
    service: &str,
    image: &str,
) -> Result<(), DispatchError> {
    let target = snapshot
        .environment(environment)
        .ok_or_else(|| DispatchError::UnknownEnvironment(environment.to_owned()))?;
    let client = target.client();

    let policy = snapshot.policy_for(image);
    if let Some(login) = policy.login {
        let credentials = load_credentials(login).await?;
        debug!(environment, username = %credentials.username, "logging in to registry");
        client
            .login(&credentials)
            .await
            .map_err(|source| DispatchError::LoginFailed {
                environment: environment.to_owned(),
                source,
            })?;
    }

    info!(environment, service, image, backend = client.backend(), "updating service");
    client
        .pull_and_update(service, image)
        .await
        .map_err(|source| {
            warn!(environment, service, image, error = %source, "service update failed");
            DispatchError::UpdateFailed {
                environment: environment.to_owned(),
                service: service.to_owned(),
                source,
            }
        })?;
    info!(environment, service, image, "service updated");
    Ok(())
}
