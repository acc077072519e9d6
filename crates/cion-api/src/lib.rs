//! ---
//! cion_section: "05-networking-external-interfaces"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "HTTP invocation surface for the deployment worker."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cion_config::{Collection, ConfigSnapshot, Service};
use cion_worker::{DeploymentTarget, DispatchError, WorkerContext};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared API state exposed to handlers.
pub struct ApiState {
    worker: Arc<WorkerContext>,
    version: String,
    start: Instant,
}

impl ApiState {
    pub fn new(worker: Arc<WorkerContext>, version: impl Into<String>) -> Self {
        Self {
            worker,
            version: version.into(),
            start: Instant::now(),
        }
    }

    fn healthy(&self) -> bool {
        self.worker.is_ready() && !self.worker.is_shutting_down()
    }

    fn status(&self) -> StatusResponse {
        let snapshot = self.worker.snapshot();
        StatusResponse {
            ready: self.worker.is_ready(),
            shutting_down: self.worker.is_shutting_down(),
            populated: names(self.worker.store().populated_collections()),
            subscriptions: names(self.worker.active_collections()),
            revision: snapshot.revision(),
            version: self.version.clone(),
            uptime_seconds: self.start.elapsed().as_secs(),
        }
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("version", &self.version)
            .field("ready", &self.worker.is_ready())
            .finish_non_exhaustive()
    }
}

fn names(collections: Vec<Collection>) -> Vec<&'static str> {
    collections.into_iter().map(Collection::name).collect()
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(get_health))
        .route("/rpc/distribute_to", post(post_distribute_to))
        .route("/rpc/update", post(post_update))
        .route("/api/status", get(get_status))
        .route("/api/config", get(get_config))
        .route("/api/environments/:name/services", get(get_environment_services))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the invocation API. Binding to port `0` picks a free port.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let router = router(state);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Health body; `status` is 0 when serving and 1 otherwise.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: u8,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ready: bool,
    shutting_down: bool,
    populated: Vec<&'static str>,
    subscriptions: Vec<&'static str>,
    revision: u64,
    version: String,
    uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct DistributeRequest {
    image: String,
}

#[derive(Debug, Serialize)]
struct DistributeResponse {
    image: String,
    targets: Vec<DeploymentTarget>,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    environment: String,
    service: String,
    image: String,
}

#[derive(Debug, Serialize)]
struct UpdateResponse {
    updated: bool,
}

#[derive(Debug, Serialize)]
struct EnvironmentServices {
    environment: String,
    services: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    revision: u64,
    default_glob: String,
    environments: Vec<EnvironmentSummary>,
    services: Vec<Service>,
    repos: Vec<UserReposSummary>,
}

#[derive(Debug, Serialize)]
struct EnvironmentSummary {
    name: String,
    mode: &'static str,
    sign: bool,
    tag_match: Option<String>,
}

#[derive(Debug, Serialize)]
struct UserReposSummary {
    user: String,
    repos: Vec<RepoSummary>,
}

#[derive(Debug, Serialize)]
struct RepoSummary {
    repo: String,
    login: Option<String>,
    glob: Option<String>,
}

impl From<&ConfigSnapshot> for ConfigSummary {
    fn from(snapshot: &ConfigSnapshot) -> Self {
        Self {
            revision: snapshot.revision(),
            default_glob: snapshot.default_glob().source().to_owned(),
            environments: snapshot
                .environments()
                .map(|env| EnvironmentSummary {
                    name: env.name().to_owned(),
                    mode: env.mode(),
                    sign: env.sign(),
                    tag_match: env.tag_match().map(str::to_owned),
                })
                .collect(),
            services: snapshot
                .services()
                .map(|service| service.as_ref().clone())
                .collect(),
            repos: snapshot
                .repo_policies()
                .map(|policies| UserReposSummary {
                    user: policies.user().to_owned(),
                    repos: policies
                        .repos()
                        .map(|(repo, policy)| RepoSummary {
                            repo: repo.to_owned(),
                            login: policy.login().map(|path| path.display().to_string()),
                            glob: policy.glob().map(|glob| glob.source().to_owned()),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    kind: &'static str,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::UnknownEnvironment(_) => StatusCode::NOT_FOUND,
            DispatchError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::LoginFailed { .. }
            | DispatchError::UpdateFailed { .. }
            | DispatchError::ListFailed { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::CredentialFile { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match std::error::Error::source(&err) {
            Some(cause) => format!("{err}: {cause}"),
            None => err.to_string(),
        };
        Self {
            status,
            kind: err.kind(),
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            kind: self.kind,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn get_health(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<HealthResponse>) {
    if state.healthy() {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: 0,
                message: "ok".to_owned(),
            }),
        )
    } else {
        let message = if state.worker.is_shutting_down() {
            "shutting down"
        } else {
            "configuration not loaded"
        };
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: 1,
                message: message.to_owned(),
            }),
        )
    }
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(state.status())
}

async fn get_config(State(state): State<Arc<ApiState>>) -> Json<ConfigSummary> {
    Json(ConfigSummary::from(state.worker.snapshot().as_ref()))
}

async fn post_distribute_to(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<DistributeRequest>,
) -> Result<Json<DistributeResponse>, ApiError> {
    let targets = state.worker.distribute_to(&request.image).await?;
    Ok(Json(DistributeResponse {
        image: request.image,
        targets,
    }))
}

async fn post_update(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<UpdateResponse>, ApiError> {
    state
        .worker
        .update(&request.environment, &request.service, &request.image)
        .await
        .map_err(|err| {
            warn!(
                environment = %request.environment,
                service = %request.service,
                image = %request.image,
                error = %err,
                "update request failed"
            );
            ApiError::from(err)
        })?;
    Ok(Json(UpdateResponse { updated: true }))
}

async fn get_environment_services(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<EnvironmentServices>, ApiError> {
    let services = state.worker.list_service_names(&name).await?;
    Ok(Json(EnvironmentServices {
        environment: name,
        services: services.into_iter().collect(),
    }))
}
