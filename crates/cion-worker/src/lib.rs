//! ---
//! cion_section: "01-core-functionality"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Image routing, update dispatch and worker lifecycle."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Deployment worker core.
//!
//! [`distribute_to`] maps a freshly built image onto the environments and
//! services that should run it; [`update`] rolls one of those targets. The
//! [`WorkerContext`] ties both to a live configuration store fed by a
//! change feed.

pub mod context;
pub mod dispatcher;
pub mod resolver;

pub use context::{WorkerContext, WorkerError, WorkerOptions};
pub use dispatcher::{load_credentials, update, DispatchError};
pub use resolver::{distribute_to, DeploymentTarget};
