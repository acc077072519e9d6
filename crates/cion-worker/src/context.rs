//! ---
//! cion_section: "01-core-functionality"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Image routing, update dispatch and worker lifecycle."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Worker lifecycle: `init` → serve → `teardown`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cion_config::{Collection, ConfigError, ConfigSnapshot, ConfigStore, DEFAULT_GLOB};
use cion_feed::{DocumentFeed, FeedError, SubscriptionManager};
use cion_metrics::WorkerMetrics;
use cion_orchestration::ClientFactory;
use thiserror::Error;
use tracing::info;

use crate::{dispatcher, resolver, DeploymentTarget, DispatchError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid worker configuration")]
    Config(#[from] ConfigError),
    #[error("failed to start configuration subscriptions")]
    Feed(#[from] FeedError),
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Routing glob used when no repository policy applies.
    pub default_glob: String,
    pub metrics: Option<WorkerMetrics>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            default_glob: DEFAULT_GLOB.to_owned(),
            metrics: None,
        }
    }
}

/// Owns the configuration store and its subscriptions for the lifetime of
/// the worker. Every call reads one snapshot and never sees a later change.
#[derive(Debug)]
pub struct WorkerContext {
    store: Arc<ConfigStore>,
    manager: SubscriptionManager,
    metrics: Option<WorkerMetrics>,
    shutting_down: AtomicBool,
}

impl WorkerContext {
    /// Build the store, replay every collection from `feed` and keep them
    /// live. The returned context is ready.
    pub async fn init(
        feed: Arc<dyn DocumentFeed>,
        factory: Arc<dyn ClientFactory>,
        options: WorkerOptions,
    ) -> Result<Self, WorkerError> {
        let store = Arc::new(ConfigStore::with_default_glob(&options.default_glob)?);
        if let Some(metrics) = &options.metrics {
            for collection in Collection::ALL {
                let metrics = metrics.clone();
                store.on_update(collection, move |update| {
                    metrics.set_entity_count(collection.name(), update.snapshot.len(collection));
                    Ok(())
                });
            }
        }

        let mut manager = SubscriptionManager::new(feed, Arc::clone(&store), factory);
        if let Some(metrics) = &options.metrics {
            manager = manager.with_metrics(metrics.clone());
        }
        manager.start().await?;

        let snapshot = store.snapshot();
        if let Some(metrics) = &options.metrics {
            for collection in Collection::ALL {
                metrics.set_entity_count(collection.name(), snapshot.len(collection));
            }
        }
        info!(
            environments = snapshot.len(Collection::Environments),
            services = snapshot.len(Collection::Services),
            repos = snapshot.len(Collection::Repos),
            revision = snapshot.revision(),
            "worker initialised"
        );

        Ok(Self {
            store,
            manager,
            metrics: options.metrics,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.store.snapshot()
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_ready()
    }

    pub async fn ready(&self) {
        self.store.ready().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn active_collections(&self) -> Vec<Collection> {
        self.manager.active_collections()
    }

    /// Deployment targets for `image` against the current configuration.
    pub async fn distribute_to(&self, image: &str) -> Result<Vec<DeploymentTarget>, DispatchError> {
        self.accepting()?;
        let snapshot = self.store.ready_snapshot().await;
        let targets = resolver::distribute_to(&snapshot, image);
        if let Some(metrics) = &self.metrics {
            metrics.record_routing(targets.len());
        }
        Ok(targets)
    }

    /// Roll `service` on `environment` to `image`.
    pub async fn update(
        &self,
        environment: &str,
        service: &str,
        image: &str,
    ) -> Result<(), DispatchError> {
        self.accepting()?;
        let snapshot = self.store.ready_snapshot().await;
        let started = Instant::now();
        let result = dispatcher::update(&snapshot, environment, service, image).await;
        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(()) => "success",
                Err(err) => err.kind(),
            };
            metrics.record_update(environment, outcome, started.elapsed());
        }
        result
    }

    /// Service names currently deployed on `environment`.
    pub async fn list_service_names(
        &self,
        environment: &str,
    ) -> Result<BTreeSet<String>, DispatchError> {
        self.accepting()?;
        let snapshot = self.store.ready_snapshot().await;
        let target = snapshot
            .environment(environment)
            .ok_or_else(|| DispatchError::UnknownEnvironment(environment.to_owned()))?;
        target
            .client()
            .list_service_names()
            .await
            .map_err(|source| DispatchError::ListFailed {
                environment: environment.to_owned(),
                source,
            })
    }

    /// Stop accepting calls and dispose every subscription. Calls already
    /// running finish against the snapshot they started with. Returns the
    /// number of subscriptions disposed; zero on repeated calls.
    pub fn teardown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let disposed = self.manager.teardown();
        info!(disposed, "worker torn down");
        disposed
    }

    fn accepting(&self) -> Result<(), DispatchError> {
        if self.is_shutting_down() {
            Err(DispatchError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
