//! ---
//! cion_section: "01-core-functionality"
//! cion_subsection: "binary"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Binary entrypoint for the cion worker daemon."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use cion_api::{spawn_api_server, ApiServer, ApiState, HealthResponse};
use cion_common::{init_tracing, AppConfig};
use cion_config::{document_key, parse_document, Collection, Entity};
use cion_feed::{DirectoryFeed, DocumentFeed};
use cion_metrics::{new_registry, spawn_http_server, DaemonMetrics, WorkerMetrics};
use cion_orchestration::HttpClientFactory;
use cion_worker::{WorkerContext, WorkerOptions};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_PROBE_URL: &str = "http://127.0.0.1:5000/healthz";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "cion continuous-deployment worker",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", env = "CION_CONFIG", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Override the document store directory")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the worker until a termination signal arrives")]
    Run,
    #[command(about = "Parse every document of the store and exit")]
    Validate,
    #[command(about = "Print the deployment targets of an image and exit")]
    Resolve {
        #[arg(value_name = "IMAGE")]
        image: String,
    },
    #[command(about = "Query a running worker's health endpoint; exit status mirrors it")]
    Probe {
        #[arg(long, default_value = DEFAULT_PROBE_URL)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Probe { url } => probe(&url).await,
        Commands::Run => {
            run_daemon(load_config(cli.config, cli.store)?).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            let valid = validate_store(&load_config(cli.config, cli.store)?).await?;
            Ok(if valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Resolve { image } => {
            resolve(&load_config(cli.config, cli.store)?, &image).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load the daemon configuration and install tracing.
fn load_config(explicit: Option<PathBuf>, store: Option<PathBuf>) -> Result<AppConfig> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path);
    }
    candidates.push(PathBuf::from("configs/cion.toml"));
    candidates.push(PathBuf::from("/etc/cion/cion.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(store) = store {
        config.feed.root = store;
    }
    init_tracing("cion-workerd", &config.logging)?;
    info!(
        source = ?loaded.source,
        store = %config.feed.root.display(),
        "configuration loaded"
    );
    Ok(config)
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), build_profile());
    let worker_metrics = WorkerMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let started = Instant::now();
    let worker = Arc::new(
        start_worker(
            &config,
            config.metrics.enabled.then_some(worker_metrics),
        )
        .await?,
    );
    daemon_metrics.observe_config_load(started.elapsed());

    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        let state = Arc::new(ApiState::new(
            Arc::clone(&worker),
            env!("CARGO_PKG_VERSION"),
        ));
        match spawn_api_server(state, config.api.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    info!("worker running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination signal received; shutting down");
    worker.teardown();

    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn start_worker(config: &AppConfig, metrics: Option<WorkerMetrics>) -> Result<WorkerContext> {
    let feed = DirectoryFeed::new(&config.feed.root).with_debounce(config.feed.debounce);
    let options = WorkerOptions {
        default_glob: config.routing.default_glob.clone(),
        metrics,
    };
    WorkerContext::init(Arc::new(feed), Arc::new(HttpClientFactory::new()), options)
        .await
        .with_context(|| format!("failed to load document store {}", config.feed.root.display()))
}

/// Parse every stored document. Returns `false` when any was rejected.
async fn validate_store(config: &AppConfig) -> Result<bool> {
    let root = &config.feed.root;
    let feed = DirectoryFeed::new(root);
    let factory = HttpClientFactory::new();
    let mut environments = Vec::new();
    let mut services = Vec::new();
    let mut rejected = 0usize;

    for collection in Collection::ALL {
        let documents = feed
            .current(collection)
            .await
            .with_context(|| format!("unable to read {}", feed.collection_dir(collection).display()))?;
        for document in &documents {
            match parse_document(collection, document, &factory) {
                Ok(Entity::Environment(env)) => environments.push(env.name().to_owned()),
                Ok(Entity::Service(service)) => services.push(service),
                Ok(Entity::Repos(_)) => {}
                Err(err) => {
                    rejected += 1;
                    warn!(
                        collection = %collection,
                        key = ?document_key(collection, document),
                        error = %err,
                        "document rejected"
                    );
                }
            }
        }
        println!("{collection}: {} document(s)", documents.len());
    }

    for service in &services {
        for name in service
            .environments
            .iter()
            .filter(|name| !environments.contains(name))
        {
            warn!(service = %service.name, environment = %name, "service references an unknown environment");
        }
    }

    if rejected > 0 {
        println!("{rejected} document(s) rejected in {}", root.display());
        return Ok(false);
    }
    info!(store = %root.display(), "document store is valid");
    Ok(true)
}

async fn resolve(config: &AppConfig, image: &str) -> Result<()> {
    let worker = start_worker(config, None).await?;
    let targets = worker.distribute_to(image).await?;
    let snapshot = worker.snapshot();
    info!(
        image,
        revision = snapshot.revision(),
        environments = snapshot.len(Collection::Environments),
        services = snapshot.len(Collection::Services),
        targets = targets.len(),
        "image resolved against store"
    );
    println!("{}", serde_json::to_string_pretty(&targets)?);
    worker.teardown();
    Ok(())
}

/// GET `url` and map its health `status` onto the process exit code.
async fn probe(url: &str) -> Result<ExitCode> {
    let response = match reqwest::get(url).await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("{url}: {err}");
            return Ok(ExitCode::FAILURE);
        }
    };
    let health: HealthResponse = response
        .json()
        .await
        .with_context(|| format!("unexpected health response from {url}"))?;
    println!("{}", health.message);
    Ok(ExitCode::from(health.status))
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
