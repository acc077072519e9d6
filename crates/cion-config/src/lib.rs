//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Typed configuration for the worker.
//!
//! Raw documents from the change feed are turned into [`Entity`] values by
//! [`parse_document`] and folded into the [`ConfigStore`]. Readers only ever
//! see immutable [`ConfigSnapshot`]s.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use cion_orchestration::ClientFactory;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod environment;
pub mod error;
mod paths;
pub mod pattern;
pub mod repo;
pub mod service;
pub mod snapshot;
pub mod store;

pub use cion_common::DEFAULT_GLOB;
pub use environment::Environment;
pub use error::ConfigError;
pub use pattern::{Glob, ImageParts, Pattern};
pub use repo::{RepoPolicy, ResolvedPolicy, UserRepoPolicies};
pub use service::Service;
pub use snapshot::ConfigSnapshot;
pub use store::{ConfigStore, ConfigUpdate, Listener, ListenerResult};

/// The configuration collections mirrored from the document store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Environments,
    Services,
    Repos,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Environments,
        Collection::Services,
        Collection::Repos,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Environments => "environments",
            Collection::Services => "services",
            Collection::Repos => "repos",
        }
    }

    /// Document field holding the entity key.
    pub fn key_field(self) -> &'static str {
        match self {
            Collection::Environments | Collection::Services => "name",
            Collection::Repos => "user",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Collection::Environments => 0,
            Collection::Services => 1,
            Collection::Repos => 2,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|collection| collection.name() == value)
            .ok_or_else(|| ConfigError::UnknownCollection(value.to_owned()))
    }
}

/// A parsed configuration entity, shared into snapshots.
#[derive(Debug, Clone)]
pub enum Entity {
    Environment(Arc<Environment>),
    Service(Arc<Service>),
    Repos(Arc<UserRepoPolicies>),
}

impl Entity {
    pub fn collection(&self) -> Collection {
        match self {
            Entity::Environment(_) => Collection::Environments,
            Entity::Service(_) => Collection::Services,
            Entity::Repos(_) => Collection::Repos,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Entity::Environment(environment) => environment.name(),
            Entity::Service(service) => &service.name,
            Entity::Repos(policies) => policies.user(),
        }
    }
}

/// Parse one raw document of `collection` into its typed entity.
///
/// Parsing has no side effects beyond constructing the environment's
/// orchestration client, so it can be retried with the same document.
pub fn parse_document(
    collection: Collection,
    document: &Value,
    factory: &dyn ClientFactory,
) -> Result<Entity, ConfigError> {
    match collection {
        Collection::Environments => {
            Environment::parse(document, factory).map(|env| Entity::Environment(Arc::new(env)))
        }
        Collection::Services => Service::parse(document).map(|svc| Entity::Service(Arc::new(svc))),
        Collection::Repos => {
            UserRepoPolicies::parse(document).map(|repos| Entity::Repos(Arc::new(repos)))
        }
    }
}

/// Key of a raw document, used to address tombstones.
pub fn document_key(collection: Collection, document: &Value) -> Option<String> {
    document
        .get(collection.key_field())
        .and_then(Value::as_str)
        .map(str::to_owned)
}
