use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::config::{self, AppConfig};
use crate::docker::{ContainerManager, ContainerSummary, RunContainerOptions};
use crate::openloop::OpenLoopRunner;
use crate::player::{PlaybackError, PlaybackRequest, PlaybackStatus, PlaybackSupervisor};
use crate::store::{BagRecord, BagStore, StoreStats};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    supervisor: Arc<PlaybackSupervisor>,
    store: BagStore,
    containers: ContainerManager,
    config: AppConfig,
}

impl AppState {
    pub fn new(config: AppConfig, store: BagStore) -> Self {
        Self::with_parts(config, store, ContainerManager::new())
    }

    pub fn with_parts(config: AppConfig, store: BagStore, containers: ContainerManager) -> Self {
        let supervisor = Arc::new(PlaybackSupervisor::new(config.playback.clone()));
        Self {
            inner: Arc::new(AppStateInner {
                supervisor,
                store,
                containers,
                config,
            }),
        }
    }

    pub fn supervisor(&self) -> &PlaybackSupervisor {
        &self.inner.supervisor
    }

    pub fn store(&self) -> &BagStore {
        &self.inner.store
    }

    fn open_loop_runner(&self) -> OpenLoopRunner {
        let playback = &self.inner.config.playback;
        OpenLoopRunner::new(
            Arc::clone(&self.inner.supervisor),
            self.inner.containers.clone(),
            Duration::from_secs_f64(playback.attach_delay_secs),
            Duration::from_secs_f64(playback.completion_poll_secs),
            self.inner.config.paths.output_dir.clone(),
        )
    }
}

/// Build runtime state for a data directory: loads config and opens the
/// metadata store (db path resolved against the data dir unless absolute).
pub fn app_state_for_data_dir(config: AppConfig, data_dir: &std::path::Path) -> anyhow::Result<AppState> {
    let db_path = config::resolve_relative_to(data_dir, &config.paths.db_path);
    let store = BagStore::new(&db_path)?;
    Ok(AppState::new(config, store))
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(api_root))
        .route("/api/health", get(health))
        .route("/api/stats", get(get_stats))
        .route("/api/rosbags", get(list_bags))
        .route("/api/rosbags/{map_category}", get(list_bags_by_category))
        .route("/api/rosbags/play/start", post(play_start))
        .route("/api/rosbags/play/stop", post(play_stop))
        .route("/api/rosbags/play/status", post(play_status))
        .route("/api/test/open_loop", post(run_open_loop))
        .route("/api/docker/run", post(docker_run))
        .route("/api/docker/stop/{id}", post(docker_stop))
        .route("/api/docker/copy/{id}", post(docker_copy))
        .route("/api/docker/remove/{id}", delete(docker_remove))
        .route("/api/docker/containers", get(docker_containers))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize)]
pub struct PlayStartResponse {
    pub message: String,
    pub running: bool,
}

#[derive(Deserialize)]
pub struct OpenLoopRequest {
    pub rosbag_paths: Vec<PathBuf>,
    pub image_tag: String,
}

#[derive(Deserialize)]
pub struct DockerRunQuery {
    pub image_tag: Option<String>,
    pub container_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ContainerCopyRequest {
    pub source_path: String,
    pub destination_path: PathBuf,
}

#[derive(Serialize)]
pub struct DockerRunResponse {
    pub message: String,
    pub container_id: String,
}

async fn api_root() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Welcome to the bagcockpit API".to_string(),
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AppError> {
    let stats = state.inner.store.stats()?;
    Ok(Json(stats))
}

async fn list_bags(State(state): State<AppState>) -> Result<Json<Vec<BagRecord>>, AppError> {
    let bags = state.inner.store.all_bags()?;
    Ok(Json(bags))
}

async fn list_bags_by_category(
    State(state): State<AppState>,
    Path(map_category): Path<String>,
) -> Result<Json<Vec<BagRecord>>, AppError> {
    let bags = state.inner.store.bags_by_category(&map_category)?;
    Ok(Json(bags))
}

#[derive(Debug, PartialEq, Eq)]
struct PlayStartParams {
    bag_path: String,
    topics: Vec<String>,
    loop_playback: bool,
    publish_clock: bool,
}

/// Manual query parsing so repeated `topics` keys accumulate instead of
/// clobbering each other.
fn parse_play_query(pairs: &[(String, String)]) -> Result<PlayStartParams, String> {
    let mut bag_path = None;
    let mut topics = Vec::new();
    let mut loop_playback = false;
    let mut publish_clock = true;

    for (key, value) in pairs {
        match key.as_str() {
            "bag_path" => bag_path = Some(value.clone()),
            "topics" => {
                if !value.is_empty() {
                    topics.push(value.clone());
                }
            }
            "loop_playback" => loop_playback = parse_bool_param(key, value)?,
            "publish_clock" => publish_clock = parse_bool_param(key, value)?,
            _ => {}
        }
    }

    let bag_path = bag_path
        .filter(|path| !path.is_empty())
        .ok_or_else(|| "missing required query parameter: bag_path".to_string())?;

    Ok(PlayStartParams {
        bag_path,
        topics,
        loop_playback,
        publish_clock,
    })
}

fn parse_bool_param(key: &str, value: &str) -> Result<bool, String> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(format!("invalid boolean for {key}: {value}")),
    }
}

async fn play_start(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<PlayStartResponse>, AppError> {
    let params = parse_play_query(&pairs).map_err(AppError::BadRequest)?;

    let record = state
        .inner
        .store
        .bag_by_path(&params.bag_path)?
        .ok_or_else(|| {
            AppError::NotFound(format!("rosbag with path {} not found", params.bag_path))
        })?;

    let request = PlaybackRequest {
        bag_path: PathBuf::from(&record.file_path),
        topics: params.topics,
        loop_playback: params.loop_playback,
        publish_clock: params.publish_clock,
    };
    let running = state.inner.supervisor.start(&request).await?;

    Ok(Json(PlayStartResponse {
        message: format!("started playing rosbag {}", record.file_path),
        running,
    }))
}

async fn play_stop(State(state): State<AppState>) -> Json<MessageResponse> {
    let message = state.inner.supervisor.stop().await;
    Json(MessageResponse { message })
}

async fn play_status(State(state): State<AppState>) -> Json<PlaybackStatus> {
    Json(state.inner.supervisor.status())
}

async fn run_open_loop(
    State(state): State<AppState>,
    Json(payload): Json<OpenLoopRequest>,
) -> Response {
    let report = state
        .open_loop_runner()
        .run(&payload.rosbag_paths, &payload.image_tag)
        .await;

    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report)).into_response()
}

async fn docker_run(
    State(state): State<AppState>,
    Query(query): Query<DockerRunQuery>,
    body: axum::body::Bytes,
) -> Result<Json<DockerRunResponse>, AppError> {
    if let Some(container_id) = query.container_id {
        state.inner.containers.start_container(&container_id).await?;
        return Ok(Json(DockerRunResponse {
            message: "container restarted".to_string(),
            container_id,
        }));
    }

    let image_tag = query.image_tag.ok_or_else(|| {
        AppError::BadRequest("either image_tag or container_id is required".to_string())
    })?;
    // run options are optional; an empty body means the defaults
    let options = if body.is_empty() {
        RunContainerOptions::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid container options: {e}")))?
    };
    let container_id = state
        .inner
        .containers
        .run_container(&image_tag, &options)
        .await?;

    Ok(Json(DockerRunResponse {
        message: "container started".to_string(),
        container_id,
    }))
}

async fn docker_stop(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    state.inner.containers.stop_container(&container_id).await?;
    Ok(Json(MessageResponse {
        message: format!("container {container_id} stopped"),
    }))
}

async fn docker_copy(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    Json(payload): Json<ContainerCopyRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    state
        .inner
        .containers
        .copy_from_container(&container_id, &payload.source_path, &payload.destination_path)
        .await?;
    Ok(Json(MessageResponse {
        message: format!(
            "copied {} to {}",
            payload.source_path,
            payload.destination_path.display()
        ),
    }))
}

async fn docker_remove(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    state
        .inner
        .containers
        .remove_container(&container_id)
        .await?;
    Ok(Json(MessageResponse {
        message: format!("container {container_id} removed"),
    }))
}

async fn docker_containers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ContainerSummary>>, AppError> {
    let containers = state.inner.containers.list_containers().await?;
    Ok(Json(containers))
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("unknown API route: /api/{path}"))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        warn!(error = format!("{err:#}"), "request failed");
        AppError::Internal(format!("{err:#}"))
    }
}

impl From<PlaybackError> for AppError {
    fn from(err: PlaybackError) -> Self {
        match err {
            PlaybackError::Busy => AppError::Conflict(err.to_string()),
            PlaybackError::BagNotFound(_) => AppError::NotFound(err.to_string()),
            PlaybackError::Launch(_) => AppError::Internal(err.to_string()),
        }
    }
}
