//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Document change feeds and subscription management."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cion_config::{document_key, Collection};
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{ChangeEvent, ChangeStream, DocumentFeed, FeedError};

type Subscriber = UnboundedSender<Result<ChangeEvent, FeedError>>;

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<Collection, IndexMap<String, Value>>,
    subscribers: BTreeMap<Collection, Vec<Subscriber>>,
    closed: bool,
}

impl MemoryState {
    fn publish(&mut self, collection: Collection, event: ChangeEvent) {
        if let Some(subscribers) = self.subscribers.get_mut(&collection) {
            subscribers.retain(|subscriber| subscriber.unbounded_send(Ok(event.clone())).is_ok());
        }
    }
}

/// Feed backed by process memory. Clones share the same documents.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFeed {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `document` and notify subscribers.
    ///
    /// Documents without a key are still published so consumers can reject
    /// them, but they are not persisted.
    pub fn upsert(&self, collection: Collection, document: Value) {
        let mut state = self.state.lock();
        let old_value = match document_key(collection, &document) {
            Some(key) => state
                .documents
                .entry(collection)
                .or_default()
                .insert(key, document.clone()),
            None => None,
        };
        state.publish(collection, ChangeEvent::upsert(collection, old_value, document));
    }

    /// Delete the document stored under `key`. Returns whether it existed.
    pub fn remove(&self, collection: Collection, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state
            .documents
            .get_mut(&collection)
            .and_then(|documents| documents.shift_remove(key));
        match removed {
            Some(old_value) => {
                state.publish(collection, ChangeEvent::delete(collection, old_value));
                true
            }
            None => false,
        }
    }

    /// Deliver a raw event without touching the stored documents.
    pub fn publish(&self, collection: Collection, event: ChangeEvent) {
        self.state.lock().publish(collection, event);
    }

    /// Fail every stream of `collection`; the streams end after the error.
    pub fn fail(&self, collection: Collection, message: &str) {
        let subscribers = self
            .state
            .lock()
            .subscribers
            .remove(&collection)
            .unwrap_or_default();
        for subscriber in subscribers {
            let _ = subscriber.unbounded_send(Err(FeedError::Backend(message.to_owned())));
        }
    }

    /// End every stream. Later subscriptions end immediately.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Streams of `collection` that are still being consumed.
    pub fn subscriber_count(&self, collection: Collection) -> usize {
        let mut state = self.state.lock();
        match state.subscribers.get_mut(&collection) {
            Some(subscribers) => {
                subscribers.retain(|subscriber| !subscriber.is_closed());
                subscribers.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl DocumentFeed for InMemoryFeed {
    async fn current(&self, collection: Collection) -> Result<Vec<Value>, FeedError> {
        Ok(self
            .state
            .lock()
            .documents
            .get(&collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn subscribe(&self, collection: Collection) -> Result<ChangeStream, FeedError> {
        let (sender, receiver) = mpsc::unbounded();
        let mut state = self.state.lock();
        if !state.closed {
            state.subscribers.entry(collection).or_default().push(sender);
        }
        Ok(receiver.boxed())
    }
}
