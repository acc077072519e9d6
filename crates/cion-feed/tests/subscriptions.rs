//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "tests"
//! cion_type: "test"
//! cion_scope: "code"
//! cion_description: "Subscription manager behaviour against in-memory and directory feeds."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cion_config::{Collection, ConfigStore, DEFAULT_GLOB};
use cion_feed::{
    ChangeEvent, ChangeStream, DirectoryFeed, DocumentFeed, FeedError, InMemoryFeed,
    SubscriptionManager,
};
use parking_lot::Mutex;
use serde_json::Value;
use cion_metrics::{new_registry, WorkerMetrics};
use cion_testharness::{documents, RecordingFactory};
use serde_json::json;

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn manager(feed: Arc<dyn DocumentFeed>) -> SubscriptionManager {
    let store = Arc::new(ConfigStore::with_default_glob(DEFAULT_GLOB).unwrap());
    SubscriptionManager::new(feed, store, Arc::new(RecordingFactory::new()))
}

#[tokio::test(flavor = "multi_thread")]
async fn replays_current_documents_before_reporting_ready() {
    let feed = InMemoryFeed::new();
    feed.upsert(Collection::Environments, documents::environment("prod", Some("v.*")));
    feed.upsert(
        Collection::Services,
        documents::service("widgets", "acme/widgets", &["prod"]),
    );
    let manager = manager(Arc::new(feed.clone()));
    assert!(!manager.store().is_ready());

    manager.start().await.unwrap();

    assert!(manager.store().is_ready());
    let snapshot = manager.store().snapshot();
    assert!(snapshot.environment("prod").is_some());
    assert_eq!(snapshot.service("widgets").unwrap().image, "acme/widgets");
    assert_eq!(manager.active_collections(), Collection::ALL.to_vec());
    manager.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn live_changes_are_applied_in_feed_order() {
    let feed = InMemoryFeed::new();
    let manager = manager(Arc::new(feed.clone()));
    manager.start().await.unwrap();

    feed.upsert(Collection::Services, documents::service("a", "acme/a", &[]));
    feed.upsert(Collection::Services, documents::service("b", "acme/b", &[]));
    feed.upsert(Collection::Services, documents::service("a", "acme/a2", &[]));
    feed.remove(Collection::Services, "b");
    feed.upsert(Collection::Services, documents::service("c", "acme/c", &[]));

    let store = Arc::clone(manager.store());
    eventually("service c", || store.snapshot().service("c").is_some()).await;
    let snapshot = store.snapshot();
    assert_eq!(snapshot.keys(Collection::Services), vec!["a", "c"]);
    assert_eq!(snapshot.service("a").unwrap().image, "acme/a2");
    manager.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_documents_keep_the_previous_entity() {
    let feed = InMemoryFeed::new();
    feed.upsert(Collection::Environments, documents::environment("prod", Some("v.*")));
    let registry = new_registry();
    let manager = manager(Arc::new(feed.clone()))
        .with_metrics(WorkerMetrics::new(registry.clone()).unwrap());
    manager.start().await.unwrap();

    feed.upsert(Collection::Environments, json!({"name": "prod", "tag-match": "rc.*"}));
    feed.upsert(
        Collection::Environments,
        json!({"name": "prod", "mode": "from_env", "tag-match": "v(["}),
    );
    feed.upsert(Collection::Environments, documents::environment("marker", None));

    let store = Arc::clone(manager.store());
    eventually("marker environment", || {
        store.snapshot().environment("marker").is_some()
    })
    .await;
    let prod = store.snapshot().environment("prod").cloned().unwrap();
    assert_eq!(prod.tag_match(), Some("v.*"));
    assert!(manager.subscription(Collection::Environments).unwrap().is_active());

    let rejected = registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == "cion_config_events_total")
        .unwrap()
        .get_metric()
        .iter()
        .filter(|metric| {
            metric
                .get_label()
                .iter()
                .any(|label| label.get_name() == "outcome" && label.get_value() == "rejected")
        })
        .map(|metric| metric.get_counter().get_value())
        .sum::<f64>();
    assert_eq!(rejected, 2.0);
    manager.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn renamed_documents_drop_the_old_key() {
    let feed = InMemoryFeed::new();
    let manager = manager(Arc::new(feed.clone()));
    manager.start().await.unwrap();

    feed.upsert(Collection::Services, documents::service("old", "acme/a", &[]));
    feed.publish(
        Collection::Services,
        ChangeEvent::upsert(
            Collection::Services,
            Some(documents::service("old", "acme/a", &[])),
            documents::service("new", "acme/a", &[]),
        ),
    );

    let store = Arc::clone(manager.store());
    eventually("renamed service", || store.snapshot().service("new").is_some()).await;
    assert!(store.snapshot().service("old").is_none());
    manager.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn renames_never_publish_a_snapshot_without_the_entity() {
    let feed = InMemoryFeed::new();
    feed.upsert(Collection::Services, documents::service("old", "acme/a", &[]));
    let manager = manager(Arc::new(feed.clone()));
    manager.start().await.unwrap();

    let published = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&published);
    manager.store().on_update(Collection::Services, move |update| {
        let keys: Vec<String> = update
            .snapshot
            .keys(Collection::Services)
            .into_iter()
            .map(str::to_owned)
            .collect();
        record.lock().push(keys);
        Ok(())
    });
    feed.publish(
        Collection::Services,
        ChangeEvent::upsert(
            Collection::Services,
            Some(documents::service("old", "acme/a", &[])),
            documents::service("new", "acme/a", &[]),
        ),
    );

    let store = Arc::clone(manager.store());
    eventually("renamed service", || store.snapshot().service("new").is_some()).await;
    assert_eq!(*published.lock(), vec![vec!["new".to_owned()]]);
    manager.teardown();
}

/// Feed whose subscriptions to one collection fail.
#[derive(Debug)]
struct RefusingFeed {
    inner: InMemoryFeed,
    refused: Collection,
}

#[async_trait]
impl DocumentFeed for RefusingFeed {
    async fn current(&self, collection: Collection) -> Result<Vec<Value>, FeedError> {
        self.inner.current(collection).await
    }

    async fn subscribe(&self, collection: Collection) -> Result<ChangeStream, FeedError> {
        if collection == self.refused {
            return Err(FeedError::Backend("subscription refused".to_owned()));
        }
        self.inner.subscribe(collection).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_start_disposes_started_collections() {
    let feed = InMemoryFeed::new();
    let manager = manager(Arc::new(RefusingFeed {
        inner: feed.clone(),
        refused: Collection::Repos,
    }));
    let store = Arc::clone(manager.store());

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, FeedError::Backend(_)));
    assert!(manager.active_collections().is_empty());
    eventually("streams dropped", || {
        Collection::ALL
            .iter()
            .all(|collection| feed.subscriber_count(*collection) == 0)
    })
    .await;

    feed.upsert(Collection::Services, documents::service("ghost", "acme/a", &[]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.snapshot().service("ghost").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_manager_stops_its_streams() {
    let feed = InMemoryFeed::new();
    let manager = manager(Arc::new(feed.clone()));
    manager.start().await.unwrap();
    let store = Arc::clone(manager.store());
    drop(manager);

    eventually("streams dropped", || {
        Collection::ALL
            .iter()
            .all(|collection| feed.subscriber_count(*collection) == 0)
    })
    .await;
    feed.upsert(Collection::Services, documents::service("ghost", "acme/a", &[]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.snapshot().service("ghost").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn disposing_twice_is_a_no_op() {
    let feed = InMemoryFeed::new();
    let manager = manager(Arc::new(feed.clone()));
    manager.start().await.unwrap();

    let repos = manager.subscription(Collection::Repos).unwrap();
    assert!(repos.dispose());
    assert!(!repos.dispose());
    assert!(!repos.is_active());
    assert_eq!(
        manager.active_collections(),
        vec![Collection::Environments, Collection::Services]
    );
    eventually("repo stream dropped", || {
        feed.subscriber_count(Collection::Repos) == 0
    })
    .await;

    assert_eq!(manager.teardown(), 2);
    assert_eq!(manager.teardown(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_feeds_leave_the_active_set() {
    let feed = InMemoryFeed::new();
    let manager = manager(Arc::new(feed.clone()));
    manager.start().await.unwrap();

    feed.fail(Collection::Services, "connection reset");
    eventually("services subscription removed", || {
        manager.subscription(Collection::Services).is_none()
    })
    .await;
    assert_eq!(
        manager.active_collections(),
        vec![Collection::Environments, Collection::Repos]
    );

    feed.upsert(Collection::Services, documents::service("late", "acme/late", &[]));
    let restarted = manager.start_collection(Collection::Services).await.unwrap();
    assert!(restarted.is_active());
    assert!(manager.store().snapshot().service("late").is_some());
    manager.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn teardown_stops_live_updates() {
    let feed = InMemoryFeed::new();
    let manager = manager(Arc::new(feed.clone()));
    manager.start().await.unwrap();
    assert_eq!(manager.teardown(), 3);

    eventually("streams dropped", || {
        Collection::ALL
            .iter()
            .all(|collection| feed.subscriber_count(*collection) == 0)
    })
    .await;
    feed.upsert(Collection::Services, documents::service("after", "acme/a", &[]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.store().snapshot().service("after").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_feed_tracks_file_edits() {
    let root = tempfile::tempdir().unwrap();
    let services = root.path().join("services");
    fs::create_dir_all(&services).unwrap();
    fs::write(
        services.join("widgets.json"),
        documents::service("widgets", "acme/widgets", &["prod"]).to_string(),
    )
    .unwrap();

    let feed = DirectoryFeed::new(root.path()).with_debounce(Duration::from_millis(20));
    let manager = manager(Arc::new(feed));
    manager.start().await.unwrap();
    let store = Arc::clone(manager.store());
    assert!(store.snapshot().service("widgets").is_some());

    fs::write(
        root.path().join("environments").join("prod.yaml"),
        "name: prod\nmode: from_env\ntag-match: v.*\n",
    )
    .unwrap();
    eventually("prod environment", || {
        store.snapshot().environment("prod").is_some()
    })
    .await;

    fs::remove_file(services.join("widgets.json")).unwrap();
    eventually("widgets removed", || store.snapshot().service("widgets").is_none()).await;
    manager.teardown();
}
