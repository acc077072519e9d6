//! ---
//! cion_section: "15-testing-qa-runbook"
//! cion_subsection: "integration-tests"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Checks that the shipped sample configuration stays loadable."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cion_common::AppConfig;
use cion_config::{parse_document, Collection};
use cion_feed::{DirectoryFeed, DocumentFeed};
use cion_testharness::RecordingFactory;
use cion_worker::{distribute_to, WorkerContext, WorkerOptions};

fn repo_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(path)
}

fn read(path: &str) -> String {
    let full = repo_path(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn example_daemon_configuration_parses() {
    let config: AppConfig = read("configs/cion.example.toml")
        .parse()
        .expect("example configuration parses");
    assert_eq!(config.feed.root, PathBuf::from("configs/store"));
    assert_eq!(config.api.listen.port(), 5000);
    assert!(config.metrics.enabled);
}

#[tokio::test]
async fn every_sample_document_is_accepted() {
    let feed = DirectoryFeed::new(repo_path("configs/store"));
    let factory = RecordingFactory::new();
    for collection in Collection::ALL {
        let documents = feed.current(collection).await.unwrap();
        assert!(!documents.is_empty(), "no sample {collection} documents");
        for document in &documents {
            parse_document(collection, document, &factory)
                .unwrap_or_else(|err| panic!("sample {collection} document rejected: {err}"));
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sample_store_routes_release_tags_to_both_environments() {
    let feed = DirectoryFeed::new(repo_path("configs/store"));
    let worker = WorkerContext::init(
        Arc::new(feed),
        Arc::new(RecordingFactory::new()),
        WorkerOptions::default(),
    )
    .await
    .unwrap();
    let snapshot = worker.snapshot();

    let release: Vec<_> = distribute_to(&snapshot, "acme/widgets:v1.4")
        .into_iter()
        .map(|target| target.environment)
        .collect();
    assert_eq!(release, vec!["staging", "prod"]);

    let nightly: Vec<_> = distribute_to(&snapshot, "acme/widgets:nightly")
        .into_iter()
        .map(|target| target.environment)
        .collect();
    assert_eq!(nightly, vec!["staging"]);
    worker.teardown();
}
