//! ---
//! cion_section: "05-networking-external-interfaces"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Orchestration cluster capability and HTTP backends."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by orchestration backends.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection settings cannot produce a usable client.
    #[error("invalid client configuration: {0}")]
    Configuration(String),
    /// A certificate or key file could not be read.
    #[error("failed to read {path:?}")]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Transport-level failure talking to the backend.
    #[error("request {operation} failed")]
    Http {
        /// Logical operation, e.g. `pull acme/widgets:v2`.
        operation: String,
        /// Underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },
    /// The backend answered with a non-success status.
    #[error("{operation} returned status {status}: {body}")]
    Status {
        /// Logical operation that was rejected.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Response body, trimmed.
        body: String,
    },
    /// The backend answered with a payload we could not interpret.
    #[error("unexpected response to {operation}: {reason}")]
    Protocol {
        /// Logical operation.
        operation: String,
        /// What was wrong with the response.
        reason: String,
    },
    /// The named service or deployment does not exist on the target.
    #[error("service '{0}' not found")]
    ServiceNotFound(String),
}

impl ClientError {
    pub(crate) fn http(operation: impl Into<String>, source: reqwest::Error) -> Self {
        ClientError::Http {
            operation: operation.into(),
            source,
        }
    }

    pub(crate) fn protocol(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        ClientError::Protocol {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}
