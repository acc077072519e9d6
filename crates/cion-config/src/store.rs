//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! The reactive configuration store.
//!
//! Readers load the current [`ConfigSnapshot`] without locking. Writers build
//! a modified copy and publish it atomically, holding a per-collection lock so
//! that changes to one collection are applied one at a time while the other
//! collections stay writable.

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{Collection, ConfigError, ConfigSnapshot, Entity, Glob};

/// Outcome of a listener invocation.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback notified after every applied change to a collection.
pub type Listener = Arc<dyn Fn(&ConfigUpdate) -> ListenerResult + Send + Sync>;

/// Notification handed to listeners.
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    pub collection: Collection,
    pub key: String,
    /// Key the entity was stored under before a rename.
    pub renamed_from: Option<String>,
    /// `true` when the entity was deleted.
    pub removed: bool,
    /// Snapshot produced by this change.
    pub snapshot: Arc<ConfigSnapshot>,
}

pub struct ConfigStore {
    current: ArcSwap<ConfigSnapshot>,
    writers: [Mutex<()>; 3],
    notifying: [ReentrantMutex<()>; 3],
    listeners: [RwLock<Vec<Listener>>; 3],
    populated: watch::Sender<BTreeSet<Collection>>,
}

impl ConfigStore {
    /// Empty store using `default_glob` for images without a policy glob.
    pub fn new(default_glob: Glob) -> Self {
        let (populated, _) = watch::channel(BTreeSet::new());
        Self {
            current: ArcSwap::from_pointee(ConfigSnapshot::empty(default_glob)),
            writers: Default::default(),
            notifying: Default::default(),
            listeners: Default::default(),
            populated,
        }
    }

    pub fn with_default_glob(source: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(Glob::compile(source)?))
    }

    /// Current snapshot. Never blocks, never observes a partial change.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Replace (`Some`) or delete (`None`) the entity stored under `key`.
    ///
    /// Returns the new revision, or `None` when deleting a key that was not
    /// present. Listeners of `collection` run after the change is visible.
    pub fn apply_update(
        &self,
        collection: Collection,
        key: &str,
        entity: Option<Entity>,
    ) -> Result<Option<u64>, ConfigError> {
        if let Some(entity) = &entity {
            check_entity(collection, key, entity)?;
        }
        Ok(self.commit(collection, key, None, entity.is_none(), |current| {
            current.with_change(collection, key, entity.as_ref())
        }))
    }

    /// Move the entity stored under `previous` to the key of `entity`.
    ///
    /// The removal and the insert are published as one snapshot, so readers
    /// and listeners see either the old key or the new one. When `previous`
    /// is absent this is a plain insert.
    pub fn apply_rename(
        &self,
        collection: Collection,
        previous: &str,
        entity: Entity,
    ) -> Result<u64, ConfigError> {
        let key = entity.key().to_owned();
        check_entity(collection, &key, &entity)?;
        let renamed_from = (previous != key).then_some(previous);
        let revision = self.commit(collection, &key, renamed_from, false, |current| {
            Some(current.with_rename(collection, previous, &key, &entity))
        });
        // `with_rename` always produces a snapshot.
        Ok(revision.unwrap_or_else(|| self.snapshot().revision()))
    }

    /// Publish the snapshot built by `change` and notify listeners.
    ///
    /// Listeners run after the writer lock is released but under the
    /// collection's notification lock, taken before the writer lock is let
    /// go. Notifications of one collection therefore arrive in revision
    /// order even when writers race.
    fn commit<F>(
        &self,
        collection: Collection,
        key: &str,
        renamed_from: Option<&str>,
        removed: bool,
        change: F,
    ) -> Option<u64>
    where
        F: Fn(&ConfigSnapshot) -> Option<ConfigSnapshot>,
    {
        let (applied, _notifying) = {
            let _writer = self.writers[collection.index()].lock();
            let mut produced = None;
            self.current.rcu(|current| match change(current.as_ref()) {
                Some(next) => {
                    let next = Arc::new(next);
                    produced = Some(Arc::clone(&next));
                    next
                }
                None => {
                    produced = None;
                    Arc::clone(current)
                }
            });
            (produced, self.notifying[collection.index()].lock())
        };

        let Some(snapshot) = applied else {
            debug!(collection = %collection, key, "removal of unknown key ignored");
            return None;
        };
        let revision = snapshot.revision();
        debug!(
            collection = %collection,
            key,
            renamed_from,
            removed,
            revision,
            "configuration change applied"
        );
        self.notify(&ConfigUpdate {
            collection,
            key: key.to_owned(),
            renamed_from: renamed_from.map(str::to_owned),
            removed,
            snapshot,
        });
        Some(revision)
    }

    /// Register `listener` for changes to `collection`.
    ///
    /// Listeners of one collection are called one change at a time, in
    /// revision order. A listener may write to other collections, or to its
    /// own from the notifying thread; writing to its own collection from
    /// another thread it waits on deadlocks.
    pub fn on_update<F>(&self, collection: Collection, listener: F)
    where
        F: Fn(&ConfigUpdate) -> ListenerResult + Send + Sync + 'static,
    {
        self.listeners[collection.index()]
            .write()
            .push(Arc::new(listener));
    }

    fn notify(&self, update: &ConfigUpdate) {
        let listeners = self.listeners[update.collection.index()].read().clone();
        for (position, listener) in listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(update))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    collection = %update.collection,
                    key = %update.key,
                    listener = position,
                    error = %err,
                    "configuration listener failed"
                ),
                Err(_) => error!(
                    collection = %update.collection,
                    key = %update.key,
                    listener = position,
                    "configuration listener panicked"
                ),
            }
        }
    }

    /// Record that `collection` received its initial replay.
    pub fn mark_populated(&self, collection: Collection) {
        let newly = self
            .populated
            .send_if_modified(|populated| populated.insert(collection));
        if newly {
            info!(
                collection = %collection,
                entities = self.snapshot().len(collection),
                "collection populated"
            );
        }
    }

    pub fn is_populated(&self, collection: Collection) -> bool {
        self.populated.borrow().contains(&collection)
    }

    /// Whether every collection has been populated.
    pub fn is_ready(&self) -> bool {
        self.populated.borrow().len() == Collection::ALL.len()
    }

    pub fn populated_collections(&self) -> Vec<Collection> {
        self.populated.borrow().iter().copied().collect()
    }

    /// Wait until `collection` has received its initial replay.
    pub async fn ready_collection(&self, collection: Collection) {
        let mut populated = self.populated.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = populated
            .wait_for(|populated| populated.contains(&collection))
            .await;
    }

    /// Wait until every collection has received its initial replay.
    pub async fn ready(&self) {
        let mut populated = self.populated.subscribe();
        let _ = populated
            .wait_for(|populated| populated.len() == Collection::ALL.len())
            .await;
    }

    /// Snapshot taken once the store is fully populated.
    pub async fn ready_snapshot(&self) -> Arc<ConfigSnapshot> {
        self.ready().await;
        self.snapshot()
    }
}

fn check_entity(collection: Collection, key: &str, entity: &Entity) -> Result<(), ConfigError> {
    if entity.collection() != collection || entity.key() != key {
        return Err(ConfigError::validation(
            collection,
            format!(
                "entity {}/{} cannot be stored as {collection}/{key}",
                entity.collection(),
                entity.key()
            ),
        ));
    }
    Ok(())
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ConfigStore")
            .field("revision", &snapshot.revision())
            .field("populated", &self.populated_collections())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Environment, Service, DEFAULT_GLOB};
    use cion_testharness::RecordingFactory;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn store() -> ConfigStore {
        ConfigStore::with_default_glob(DEFAULT_GLOB).unwrap()
    }

    fn service(name: &str, image: &str) -> Entity {
        Entity::Service(Arc::new(
            Service::parse(&json!({"name": name, "image": image, "environments": ["prod"]}))
                .unwrap(),
        ))
    }

    fn environment(name: &str) -> Entity {
        let document = json!({"name": name, "mode": "from_env", "tag-match": "v.*"});
        Entity::Environment(Arc::new(
            Environment::parse(&document, &RecordingFactory::new()).unwrap(),
        ))
    }

    #[test]
    fn applying_events_folds_like_a_map() {
        let store = store();
        let events: Vec<(&str, Option<&str>)> = vec![
            ("a", Some("acme/a")),
            ("b", Some("acme/b")),
            ("a", Some("acme/a2")),
            ("c", Some("acme/c")),
            ("b", None),
            ("d", None),
            ("b", Some("acme/b3")),
        ];
        let mut expected = BTreeMap::new();
        for (key, image) in events {
            store
                .apply_update(Collection::Services, key, image.map(|image| service(key, image)))
                .unwrap();
            match image {
                Some(image) => expected.insert(key.to_owned(), image.to_owned()),
                None => expected.remove(key),
            };
            let actual: BTreeMap<_, _> = store
                .snapshot()
                .services()
                .map(|service| (service.name.clone(), service.image.clone()))
                .collect();
            assert_eq!(actual, expected);
        }
        assert_eq!(store.snapshot().keys(Collection::Services), vec!["a", "c", "b"]);
    }

    #[test]
    fn mismatched_entities_are_refused() {
        let store = store();
        let err = store
            .apply_update(Collection::Environments, "a", Some(service("a", "acme/a")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        let err = store
            .apply_update(Collection::Services, "b", Some(service("a", "acme/a")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        assert_eq!(store.snapshot().revision(), 0);
    }

    #[test]
    fn listeners_run_in_registration_order_and_survive_failures() {
        let store = store();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let record = Arc::clone(&calls);
        store.on_update(Collection::Services, move |update| {
            record.lock().push(format!("first:{}", update.key));
            Ok(())
        });
        store.on_update(Collection::Services, |_| Err("listener refused".into()));
        store.on_update(Collection::Services, |_| panic!("listener exploded"));
        let record = Arc::clone(&calls);
        store.on_update(Collection::Services, move |update| {
            record
                .lock()
                .push(format!("last:{}:{}", update.key, update.snapshot.revision()));
            Ok(())
        });

        store
            .apply_update(Collection::Services, "a", Some(service("a", "acme/a")))
            .unwrap();
        store
            .apply_update(Collection::Services, "a", None)
            .unwrap();

        assert_eq!(
            *calls.lock(),
            vec!["first:a", "last:a:1", "first:a", "last:a:2"]
        );
        assert!(store.snapshot().service("a").is_none());
    }

    #[test]
    fn listeners_only_hear_their_collection() {
        let store = store();
        let heard = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&heard);
        store.on_update(Collection::Environments, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        store
            .apply_update(Collection::Services, "a", Some(service("a", "acme/a")))
            .unwrap();
        store
            .apply_update(Collection::Environments, "prod", Some(environment("prod")))
            .unwrap();
        store
            .apply_update(Collection::Environments, "ghost", None)
            .unwrap();
        assert_eq!(heard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn renames_publish_a_single_snapshot() {
        let store = store();
        store
            .apply_update(Collection::Services, "old", Some(service("old", "acme/a")))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        store.on_update(Collection::Services, move |update| {
            let keys: Vec<String> = update
                .snapshot
                .keys(Collection::Services)
                .into_iter()
                .map(str::to_owned)
                .collect();
            record
                .lock()
                .push((update.key.clone(), update.renamed_from.clone(), keys));
            Ok(())
        });

        let revision = store
            .apply_rename(Collection::Services, "old", service("new", "acme/a"))
            .unwrap();
        assert_eq!(revision, 2);
        assert_eq!(
            *seen.lock(),
            vec![("new".to_owned(), Some("old".to_owned()), vec!["new".to_owned()])]
        );
        assert_eq!(store.snapshot().keys(Collection::Services), vec!["new"]);

        let err = store
            .apply_rename(Collection::Environments, "new", service("other", "acme/a"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        assert_eq!(store.snapshot().revision(), 2);
    }

    #[test]
    fn notifications_follow_revision_order_across_writers() {
        let store = Arc::new(store());
        let revisions = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&revisions);
        store.on_update(Collection::Services, move |update| {
            std::thread::yield_now();
            record.lock().push(update.snapshot.revision());
            Ok(())
        });

        let threads: Vec<_> = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for index in 0..25 {
                        let key = format!("svc-{worker}-{index}");
                        store
                            .apply_update(Collection::Services, &key, Some(service(&key, "acme/a")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(*revisions.lock(), (1..=100).collect::<Vec<u64>>());
    }

    #[test]
    fn listeners_may_write_back_to_their_collection() {
        let store = Arc::new(store());
        let writer = Arc::downgrade(&store);
        store.on_update(Collection::Services, move |update| {
            if update.key == "a" {
                if let Some(store) = writer.upgrade() {
                    store.apply_update(Collection::Services, "b", Some(service("b", "acme/b")))?;
                }
            }
            Ok(())
        });
        store
            .apply_update(Collection::Services, "a", Some(service("a", "acme/a")))
            .unwrap();
        assert_eq!(store.snapshot().keys(Collection::Services), vec!["a", "b"]);
    }

    #[test]
    fn other_collections_stay_writable_while_one_is_locked() {
        let store = store();
        let _environments = store.writers[Collection::Environments.index()].lock();
        let revision = store
            .apply_update(Collection::Services, "a", Some(service("a", "acme/a")))
            .unwrap();
        assert_eq!(revision, Some(1));
    }

    #[test]
    fn concurrent_writers_never_lose_updates() {
        let store = Arc::new(store());
        let threads: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for index in 0..25 {
                        let key = format!("svc-{worker}-{index}");
                        store
                            .apply_update(Collection::Services, &key, Some(service(&key, "acme/a")))
                            .unwrap();
                        let env = format!("env-{worker}-{index}");
                        store
                            .apply_update(Collection::Environments, &env, Some(environment(&env)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(Collection::Services), 200);
        assert_eq!(snapshot.len(Collection::Environments), 200);
        assert_eq!(snapshot.revision(), 400);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ready_waits_for_every_collection() {
        let store = Arc::new(store());
        assert!(!store.is_ready());

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.ready_snapshot().await.revision() })
        };
        store.mark_populated(Collection::Environments);
        store.mark_populated(Collection::Services);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store
            .apply_update(Collection::Services, "a", Some(service("a", "acme/a")))
            .unwrap();
        store.mark_populated(Collection::Repos);
        store.mark_populated(Collection::Repos);

        let revision = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revision, 1);
        assert!(store.is_ready());
        assert_eq!(store.populated_collections(), Collection::ALL.to_vec());
    }
}
