//! ---
//! cion_section: "03-persistence-logging"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Metrics collection and export utilities."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
    Opts, Registry, TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
///
/// Binding to port `0` picks a free port; [`MetricsServer::addr`] reports it.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "cion_workerd_starts_total",
            "Total number of times the worker daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "cion_workerd_config_load_seconds",
                "Time spent waiting for the initial configuration replay",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "cion_workerd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, elapsed: Duration) {
        self.config_load_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Metrics for configuration ingestion, routing and dispatch.
#[derive(Clone, Debug)]
pub struct WorkerMetrics {
    registry: SharedRegistry,
    config_events: IntCounterVec,
    entities: IntGaugeVec,
    routing_requests: IntCounterVec,
    routing_targets: IntCounter,
    updates: IntCounterVec,
    update_seconds: HistogramVec,
}

impl WorkerMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let config_events = IntCounterVec::new(
            Opts::new(
                "cion_config_events_total",
                "Configuration change events by collection and outcome",
            ),
            &["collection", "outcome"],
        )?;
        registry.register(Box::new(config_events.clone()))?;

        let entities = IntGaugeVec::new(
            Opts::new(
                "cion_config_entities",
                "Entities currently held per configuration collection",
            ),
            &["collection"],
        )?;
        registry.register(Box::new(entities.clone()))?;

        let routing_requests = IntCounterVec::new(
            Opts::new(
                "cion_routing_requests_total",
                "distribute_to invocations by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(routing_requests.clone()))?;

        let routing_targets = IntCounter::with_opts(Opts::new(
            "cion_routing_targets_total",
            "Deployment targets produced by distribute_to",
        ))?;
        registry.register(Box::new(routing_targets.clone()))?;

        let updates = IntCounterVec::new(
            Opts::new(
                "cion_updates_total",
                "update invocations by environment and outcome",
            ),
            &["environment", "outcome"],
        )?;
        registry.register(Box::new(updates.clone()))?;

        let buckets = prometheus::exponential_buckets(0.01, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let update_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cion_update_duration_seconds",
                "Time spent logging in, pulling and rolling out an image",
            )
            .buckets(buckets),
            &["environment"],
        )?;
        registry.register(Box::new(update_seconds.clone()))?;

        Ok(Self {
            registry,
            config_events,
            entities,
            routing_requests,
            routing_targets,
            updates,
            update_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_config_event(&self, collection: &str, outcome: &str) {
        self.config_events
            .with_label_values(&[collection, outcome])
            .inc();
    }

    pub fn set_entity_count(&self, collection: &str, count: usize) {
        self.entities
            .with_label_values(&[collection])
            .set(count as i64);
    }

    pub fn record_routing(&self, targets: usize) {
        let outcome = if targets == 0 { "empty" } else { "routed" };
        self.routing_requests.with_label_values(&[outcome]).inc();
        self.routing_targets.inc_by(targets as u64);
    }

    pub fn record_update(&self, environment: &str, outcome: &str, elapsed: Duration) {
        self.updates
            .with_label_values(&[environment, outcome])
            .inc();
        self.update_seconds
            .with_label_values(&[environment])
            .observe(elapsed.as_secs_f64());
    }
}

pub use prometheus;
