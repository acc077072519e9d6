//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Document change feeds and subscription management."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Change feeds for the configuration collections.
//!
//! A [`DocumentFeed`] exposes the documents currently stored for a
//! collection and a stream of subsequent changes. The
//! [`SubscriptionManager`] bridges one feed into a
//! [`ConfigStore`](cion_config::ConfigStore): it replays the current
//! documents, then keeps applying live changes until it is torn down.

use std::fmt;

use async_trait::async_trait;
use cion_config::Collection;
use futures::stream::BoxStream;
use serde_json::Value;

pub mod directory;
pub mod error;
pub mod manager;
pub mod memory;

pub use directory::DirectoryFeed;
pub use error::FeedError;
pub use manager::{Subscription, SubscriptionManager};
pub use memory::InMemoryFeed;

/// One insert, update or delete in a collection.
///
/// `new_value` is `None` for deletions; the deleted key is read from
/// `old_value`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Collection the document belongs to.
    pub document_name: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl ChangeEvent {
    pub fn upsert(collection: Collection, old_value: Option<Value>, new_value: Value) -> Self {
        Self {
            document_name: collection.name().to_owned(),
            old_value,
            new_value: Some(new_value),
        }
    }

    pub fn delete(collection: Collection, old_value: Value) -> Self {
        Self {
            document_name: collection.name().to_owned(),
            old_value: Some(old_value),
            new_value: None,
        }
    }
}

/// Live change stream of one collection. Ends when the feed closes.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// External document store the worker mirrors.
#[async_trait]
pub trait DocumentFeed: Send + Sync + fmt::Debug {
    /// Documents currently persisted for `collection`.
    async fn current(&self, collection: Collection) -> Result<Vec<Value>, FeedError>;

    /// Changes to `collection` from now on.
    async fn subscribe(&self, collection: Collection) -> Result<ChangeStream, FeedError>;
}
