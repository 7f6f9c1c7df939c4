//! Local HTTP control surface.

use crate::blocks::Block;
use crate::downloader::Downloader;
use crate::enforcement::BlockEnforcer;
use crate::error::Error;
use crate::library::Library;
use crate::player::PlaybackControl;
use crate::priority::PriorityOrchestrator;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub player: Arc<dyn PlaybackControl>,
    pub orchestrator: Arc<PriorityOrchestrator>,
    pub enforcer: Arc<BlockEnforcer>,
    pub library: Arc<Library>,
    pub downloader: Arc<dyn Downloader>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            error!(error = %self, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "status": "error", "message": self.to_string() }))).into_response()
    }
}

type ApiResult = Result<Response, Error>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Error> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| Error::InvalidInput(e.body_text()))
}

fn ok(extra: serde_json::Value) -> Response {
    let mut value = json!({ "status": "success" });
    if let (Some(obj), serde_json::Value::Object(more)) = (value.as_object_mut(), extra) {
        obj.extend(more);
    }
    Json(value).into_response()
}

/// Run blocking work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("worker failed: {}", e)))?
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/command", post(command))
        .route("/special/play", post(special_play))
        .route("/special/get_tasks", get(special_tasks))
        .route("/special/download", post(special_download))
        .route("/special/get_playlists", get(special_playlists))
        .route("/special/get_songs", get(special_songs))
        .route("/block/add", post(block_add))
        .route("/block/remove", post(block_remove))
        .route("/block/list", get(block_list))
        .route("/volume/set", post(volume_set).get(volume_set))
        .route("/volume/get", get(volume_get))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Deserialize)]
struct CommandRequest {
    #[serde(rename = "ToDO")]
    todo: Option<String>,
}

async fn command(
    State(state): State<AppState>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let command = req.todo.unwrap_or_default();
    info!(command = %command, "Received command");
    let player = state.player.clone();
    match command.as_str() {
        "play" => blocking(move || player.play()).await?,
        "pause" => blocking(move || player.pause()).await?,
        "next" => blocking(move || player.skip()).await?,
        other => {
            warn!(command = other, "Unknown command");
            return Err(Error::InvalidInput("Invalid command".into()));
        }
    }
    Ok(ok(json!({})))
}

#[derive(Deserialize)]
struct PlayRequest {
    directory: Option<String>,
    play_date: Option<String>,
    play_time: Option<String>,
}

async fn special_play(
    State(state): State<AppState>,
    payload: Result<Json<PlayRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let (Some(directory), Some(date), Some(time)) = (req.directory, req.play_date, req.play_time)
    else {
        return Err(Error::InvalidInput(
            "Required fields (directory, play_date, play_time) missing.".into(),
        ));
    };
    let orchestrator = state.orchestrator.clone();
    let task_id = blocking(move || orchestrator.add(&directory, &date, &time)).await?;
    Ok(ok(json!({ "task_id": task_id, "message": "Priority playlist planned" })))
}

async fn special_tasks(State(state): State<AppState>) -> impl IntoResponse {
    ok(json!({ "tasks": state.orchestrator.get_pending() }))
}

#[derive(Deserialize)]
struct DownloadRequest {
    name: String,
    playlist_url: String,
    #[serde(default)]
    append: bool,
}

async fn special_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let dest = state.library.playlist_dir(&req.name)?;
    let library = state.library.clone();
    let downloader = state.downloader.clone();
    let count = blocking(move || {
        if !req.append {
            let removed = library.empty_playlist(&dest)?;
            info!(playlist = %dest.display(), removed, "Replacing playlist contents");
        }
        downloader.fetch_playlist(&req.playlist_url, &dest)
    })
    .await?;
    Ok(ok(json!({ "songs": count })))
}

async fn special_playlists(State(state): State<AppState>) -> ApiResult {
    let playlists = state.library.list_playlists()?;
    Ok(ok(json!({ "playlists": playlists })))
}

#[derive(Deserialize)]
struct SongsQuery {
    name: String,
}

async fn special_songs(
    State(state): State<AppState>,
    query: Result<Query<SongsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(q) = query.map_err(|e| Error::InvalidInput(e.body_text()))?;
    let songs = state.library.list_songs(&q.name)?;
    Ok(ok(json!({ "playlist": q.name, "songs": songs })))
}

#[derive(Deserialize)]
struct BlockRequest {
    date: String,
    start_time: String,
    end_time: String,
}

impl BlockRequest {
    fn parse(&self) -> Result<Block, Error> {
        Block::parse(&self.date, &self.start_time, &self.end_time)
    }
}

async fn block_add(
    State(state): State<AppState>,
    payload: Result<Json<BlockRequest>, JsonRejection>,
) -> ApiResult {
    let block = body(payload)?.parse()?;
    let enforcer = state.enforcer.clone();
    let b = block.clone();
    if !blocking(move || enforcer.add_block(&b)).await? {
        return Err(Error::AlreadyExists(format!("Block {} already exists", block)));
    }
    Ok(ok(json!({})))
}

async fn block_remove(
    State(state): State<AppState>,
    payload: Result<Json<BlockRequest>, JsonRejection>,
) -> ApiResult {
    let block = body(payload)?.parse()?;
    let enforcer = state.enforcer.clone();
    let b = block.clone();
    if !blocking(move || enforcer.remove_block(&b)).await? {
        return Err(Error::NotFound(format!("Block {} not found", block)));
    }
    Ok(ok(json!({})))
}

async fn block_list(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "blocks": state.enforcer.blocks() }))
}

#[derive(Deserialize)]
struct VolumeRequest {
    volume: i64,
}

async fn volume_set(
    State(state): State<AppState>,
    payload: Result<Json<VolumeRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let volume = u8::try_from(req.volume)
        .ok()
        .filter(|v| *v <= 100)
        .ok_or_else(|| Error::InvalidInput(format!("Volume must be 0-100, got {}", req.volume)))?;
    let player = state.player.clone();
    blocking(move || player.set_volume(volume)).await?;
    Ok(ok(json!({ "volume": volume })))
}

async fn volume_get(State(state): State<AppState>) -> ApiResult {
    let player = state.player.clone();
    let volume = blocking(move || player.volume()).await?;
    Ok(Json(json!({ "volume": volume })).into_response())
}
