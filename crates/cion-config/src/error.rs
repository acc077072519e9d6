//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::path::PathBuf;

use cion_orchestration::ClientError;
use thiserror::Error;

use crate::Collection;

/// Errors raised while ingesting configuration documents.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is missing required keys or carries invalid values.
    #[error("invalid {collection} document: {reason}")]
    Validation {
        collection: Collection,
        reason: String,
    },
    /// A regex-valued field failed to compile or has an unusable shape.
    #[error("invalid pattern {pattern:?} in `{field}`: {reason}")]
    PatternCompile {
        field: &'static str,
        pattern: String,
        reason: String,
    },
    /// A certificate or key referenced by an environment does not exist.
    #[error("credential file {path:?} does not exist")]
    MissingCredentialFile { path: PathBuf },
    /// The orchestration client for an environment could not be built.
    #[error("unable to set up the client for environment '{environment}'")]
    ClientSetup {
        environment: String,
        #[source]
        source: ClientError,
    },
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
}

impl ConfigError {
    pub(crate) fn validation(collection: Collection, reason: impl Into<String>) -> Self {
        ConfigError::Validation {
            collection,
            reason: reason.into(),
        }
    }
}
