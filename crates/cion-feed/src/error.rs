//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Document change feeds and subscription management."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by change feeds.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {path:?}: {reason}")]
    Document { path: PathBuf, reason: String },
    #[error("failed to watch {path:?}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("change feed failed: {0}")]
    Backend(String),
}
