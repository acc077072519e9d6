//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Document change feeds and subscription management."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! One live subscription per collection, feeding the configuration store.
//!
//! Starting a collection subscribes to the feed first, replays the documents
//! currently stored, marks the collection populated and only then drains the
//! live stream. Changes made between the two reads are therefore applied
//! twice at worst, which is harmless because applying a document replaces
//! the entity under its key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cion_config::{document_key, parse_document, Collection, ConfigStore};
use cion_metrics::WorkerMetrics;
use cion_orchestration::ClientFactory;
use futures::future::try_join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{ChangeEvent, ChangeStream, DocumentFeed, FeedError};

type ActiveSet = Mutex<BTreeMap<Collection, Arc<Subscription>>>;

/// Live binding between one collection and the change feed.
pub struct Subscription {
    collection: Collection,
    disposed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    active: Weak<ActiveSet>,
}

impl Subscription {
    fn new(collection: Collection, active: Weak<ActiveSet>) -> Self {
        Self {
            collection,
            disposed: AtomicBool::new(false),
            task: Mutex::new(None),
            active,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn is_active(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
    }

    /// Stop receiving changes. Returns `false` when already disposed.
    pub fn dispose(&self) -> bool {
        if !self.retire() {
            return false;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!(collection = %self.collection, "subscription disposed");
        true
    }

    /// Mark disposed and leave the active set, exactly once.
    fn retire(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(active) = self.active.upgrade() {
            let mut active = active.lock();
            let registered = active
                .get(&self.collection)
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self));
            if registered {
                active.remove(&self.collection);
            }
        }
        true
    }

    fn attach(&self, task: JoinHandle<()>) {
        let mut slot = self.task.lock();
        if self.disposed.load(Ordering::SeqCst) {
            task.abort();
        } else {
            *slot = Some(task);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("collection", &self.collection)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Bridges a [`DocumentFeed`] into a [`ConfigStore`].
pub struct SubscriptionManager {
    feed: Arc<dyn DocumentFeed>,
    store: Arc<ConfigStore>,
    factory: Arc<dyn ClientFactory>,
    metrics: Option<WorkerMetrics>,
    active: Arc<ActiveSet>,
}

impl SubscriptionManager {
    pub fn new(
        feed: Arc<dyn DocumentFeed>,
        store: Arc<ConfigStore>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            feed,
            store,
            factory,
            metrics: None,
            active: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Start every collection concurrently.
    ///
    /// When any collection fails the ones already started are disposed
    /// before the error is returned.
    pub async fn start(&self) -> Result<(), FeedError> {
        let started = try_join_all(
            Collection::ALL
                .into_iter()
                .map(|collection| self.start_collection(collection)),
        )
        .await;
        if let Err(err) = started {
            warn!(error = %err, "start failed; disposing started subscriptions");
            self.teardown();
            return Err(err);
        }
        Ok(())
    }

    /// Replay `collection` and keep it live. Returns the existing
    /// subscription when the collection is already active.
    pub async fn start_collection(
        &self,
        collection: Collection,
    ) -> Result<Arc<Subscription>, FeedError> {
        if let Some(existing) = self.subscription(collection) {
            return Ok(existing);
        }

        let stream = self.feed.subscribe(collection).await?;
        let documents = self.feed.current(collection).await?;
        let ingest = Ingest {
            collection,
            store: Arc::clone(&self.store),
            factory: Arc::clone(&self.factory),
            metrics: self.metrics.clone(),
        };
        let replayed = documents.len();
        for document in &documents {
            ingest.upsert(None, document);
        }
        self.store.mark_populated(collection);
        debug!(collection = %collection, replayed, "initial documents replayed");

        let subscription = {
            let mut active = self.active.lock();
            if let Some(existing) = active.get(&collection) {
                return Ok(Arc::clone(existing));
            }
            let subscription = Arc::new(Subscription::new(
                collection,
                Arc::downgrade(&self.active),
            ));
            active.insert(collection, Arc::clone(&subscription));
            subscription
        };
        let task = tokio::spawn(pump(stream, ingest, Arc::clone(&subscription)));
        subscription.attach(task);
        info!(collection = %collection, "subscription started");
        Ok(subscription)
    }

    pub fn subscription(&self, collection: Collection) -> Option<Arc<Subscription>> {
        self.active.lock().get(&collection).cloned()
    }

    pub fn active_collections(&self) -> Vec<Collection> {
        self.active.lock().keys().copied().collect()
    }

    /// Dispose every active subscription. Returns how many were disposed.
    pub fn teardown(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.active.lock());
        let disposed = subscriptions
            .into_values()
            .filter(|subscription| subscription.dispose())
            .count();
        info!(disposed, "subscriptions torn down");
        disposed
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("feed", &self.feed)
            .field("active", &self.active_collections())
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if !self.active.lock().is_empty() {
            self.teardown();
        }
    }
}

async fn pump(mut stream: ChangeStream, ingest: Ingest, subscription: Arc<Subscription>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => ingest.apply(event),
            Err(err) => {
                warn!(collection = %ingest.collection, error = %err, "change feed failed");
                break;
            }
        }
    }
    if subscription.retire() {
        info!(collection = %ingest.collection, "change feed ended; subscription removed");
    }
}

/// Parses documents of one collection and applies them to the store.
#[derive(Clone)]
struct Ingest {
    collection: Collection,
    store: Arc<ConfigStore>,
    factory: Arc<dyn ClientFactory>,
    metrics: Option<WorkerMetrics>,
}

impl Ingest {
    fn apply(&self, event: ChangeEvent) {
        if event.document_name != self.collection.name() {
            debug!(
                collection = %self.collection,
                document = %event.document_name,
                "event for another collection ignored"
            );
            self.record("ignored");
            return;
        }
        match event.new_value {
            Some(document) => self.upsert(event.old_value.as_ref(), &document),
            None => self.delete(event.old_value.as_ref()),
        }
    }

    fn upsert(&self, old_value: Option<&Value>, document: &Value) {
        let entity = match parse_document(self.collection, document, self.factory.as_ref()) {
            Ok(entity) => entity,
            Err(err) => {
                warn!(
                    collection = %self.collection,
                    key = ?document_key(self.collection, document),
                    error = %err,
                    "configuration document rejected; previous value kept"
                );
                self.record("rejected");
                return;
            }
        };
        let key = entity.key().to_owned();
        let renamed_from = old_value
            .and_then(|old| document_key(self.collection, old))
            .filter(|previous| *previous != key);
        let applied = match renamed_from {
            Some(previous) => self
                .store
                .apply_rename(self.collection, &previous, entity)
                .map(|_| ()),
            None => self
                .store
                .apply_update(self.collection, &key, Some(entity))
                .map(|_| ()),
        };
        match applied {
            Ok(()) => self.record("applied"),
            Err(err) => {
                warn!(collection = %self.collection, key = %key, error = %err, "configuration update refused");
                self.record("rejected");
            }
        }
    }

    fn delete(&self, old_value: Option<&Value>) {
        match old_value.and_then(|old| document_key(self.collection, old)) {
            Some(key) => self.remove(&key),
            None => {
                warn!(collection = %self.collection, "deletion without a document key ignored");
                self.record("rejected");
            }
        }
    }

    fn remove(&self, key: &str) {
        match self.store.apply_update(self.collection, key, None) {
            Ok(Some(_)) => self.record("removed"),
            Ok(None) => self.record("ignored"),
            Err(err) => {
                warn!(collection = %self.collection, key, error = %err, "configuration removal refused");
                self.record("rejected");
            }
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_config_event(self.collection.name(), outcome);
        }
    }
}
