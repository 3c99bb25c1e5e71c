use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::backup::{self, RestoreOptions};
use crate::episodes::{EpisodeManager, IngestRequest};
use crate::error::ApiError;
use crate::graph::user_graph;
use crate::model::{EpisodeSummary, MemoryHit, UserStats};
use crate::store::{GraphStore, StoreCounts};

pub struct AppState {
    pub started: Instant,
    pub store: GraphStore,
    pub episodes: EpisodeManager,
    pub max_restore_bytes: usize,
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn build_router(state: Arc<AppState>) -> Router {
    let restore_limit = DefaultBodyLimit::max(state.max_restore_bytes);
    Router::new()
        .route("/health", get(health))
        .route("/memory/append", post(memory_append))
        .route("/memory/query", post(memory_query))
        .route("/memory/summary", post(memory_summary))
        .route("/memory/users/:user_id/episodes", get(user_episodes))
        .route("/admin/users", get(admin_users))
        .route("/admin/users/:user_id", delete(admin_delete_user))
        .route("/admin/users/:user_id/episodes", get(user_episodes))
        .route("/admin/users/:user_id/graph", get(admin_user_graph))
        .route("/admin/users/:user_id/files/:file_name", delete(admin_delete_file))
        .route("/admin/users/:user_id/backup", get(admin_backup))
        .route("/admin/users/:user_id/reprocess", post(admin_reprocess_user))
        .route("/admin/episodes/:uuid", delete(admin_delete_episode))
        .route("/admin/restore", post(admin_restore).layer(restore_limit))
        .route("/admin/reprocess", post(admin_reprocess_all))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    uptime_secs: u64,
    records: StoreCounts,
}

async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Health> {
    let records = state.store.counts()?;
    Ok(Json(Health { status: "ok", uptime_secs: state.started.elapsed().as_secs(), records }))
}

const ROLES: [&str; 3] = ["user", "assistant", "system"];

async fn memory_append(State(state): State<Arc<AppState>>, Json(req): Json<IngestRequest>) -> Response {
    if req.user_id.trim().is_empty() { return ApiError::bad_request("user_id must not be empty").into_response(); }
    if req.text.trim().is_empty() { return ApiError::bad_request("text must not be empty").into_response(); }
    if !ROLES.contains(&req.role.as_str()) {
        return ApiError::bad_request(format!("role must be one of {:?}", ROLES)).into_response();
    }
    match state.episodes.ingest(req) {
        // extraction outcome is reported on the queue's failure channel
        Ok((ack, _handle)) => Json(ack).into_response(),
        Err(err) => {
            error!(error = %format!("{:#}", err), "ingest failed");
            ApiError::from(err).into_response()
        }
    }
}

#[derive(Deserialize)]
struct QueryRequest {
    user_id: String,
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize { 10 }

#[derive(Serialize)]
struct QueryResponse {
    hits: Vec<MemoryHit>,
    total: usize,
}

async fn memory_query(State(state): State<Arc<AppState>>, Json(req): Json<QueryRequest>) -> ApiResult<QueryResponse> {
    if req.query.trim().is_empty() { return Err(ApiError::bad_request("query must not be empty")); }
    let hits = state.episodes.search(&req.user_id, &req.query, req.limit.clamp(1, 100)).await?;
    Ok(Json(QueryResponse { total: hits.len(), hits }))
}

#[derive(Deserialize)]
struct SummaryRequest {
    user_id: String,
}

async fn memory_summary(State(state): State<Arc<AppState>>, Json(req): Json<SummaryRequest>) -> ApiResult<serde_json::Value> {
    let summary = state.episodes.summary(&req.user_id).await?;
    Ok(Json(serde_json::json!({ "summary": summary })))
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct EpisodesResponse {
    episodes: Vec<EpisodeSummary>,
    total: usize,
}

async fn user_episodes(State(state): State<Arc<AppState>>, Path(user_id): Path<String>, Query(params): Query<LimitParams>) -> ApiResult<EpisodesResponse> {
    let episodes = state.episodes.user_episodes(&user_id, params.limit)?;
    Ok(Json(EpisodesResponse { total: episodes.len(), episodes }))
}

#[derive(Serialize)]
struct UsersResponse {
    users: Vec<UserStats>,
    total: usize,
}

async fn admin_users(State(state): State<Arc<AppState>>) -> ApiResult<UsersResponse> {
    let users = state.store.list_users()?;
    Ok(Json(UsersResponse { total: users.len(), users }))
}

async fn admin_delete_user(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> ApiResult<serde_json::Value> {
    let deleted = state.store.delete_user(&user_id)?;
    Ok(Json(serde_json::json!({ "ok": true, "deleted": deleted, "message": format!("User {} and all associated data deleted", user_id) })))
}

async fn admin_delete_episode(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> ApiResult<serde_json::Value> {
    if !state.store.delete_episode(&uuid)? {
        return Err(ApiError::not_found(format!("episode {} not found", uuid)));
    }
    info!(%uuid, "episode deleted");
    Ok(Json(serde_json::json!({ "ok": true, "message": format!("Episode {} deleted", uuid) })))
}

async fn admin_delete_file(State(state): State<Arc<AppState>>, Path((user_id, file_name)): Path<(String, String)>) -> ApiResult<serde_json::Value> {
    let deleted = state.store.delete_file_episodes(&user_id, &file_name)?;
    Ok(Json(serde_json::json!({ "ok": true, "deleted": deleted, "file_name": file_name })))
}

async fn admin_user_graph(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> ApiResult<serde_json::Value> {
    Ok(Json(user_graph(&state.store, &user_id)?))
}

async fn admin_backup(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> Response {
    let store = state.store.clone();
    let uid = user_id.clone();
    let archive = match tokio::task::spawn_blocking(move || backup::export_user(&store, &uid)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            error!(%user_id, %err, "backup failed");
            return ApiError::internal(format!("backup failed: {}", err)).into_response();
        }
        Err(err) => return ApiError::internal(format!("backup task failed: {}", err)).into_response(),
    };
    let disposition = format!("attachment; filename=\"{}.tar.gz\"", user_id);
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/gzip".to_string()), (header::CONTENT_DISPOSITION, disposition)], archive).into_response()
}

#[derive(Deserialize)]
struct RestoreParams {
    new_user_id: Option<String>,
    #[serde(default)]
    replace: bool,
}

async fn admin_restore(State(state): State<Arc<AppState>>, Query(params): Query<RestoreParams>, body: Bytes) -> Response {
    if body.is_empty() { return ApiError::bad_request("archive body must not be empty").into_response(); }
    let store = state.store.clone();
    let opts = RestoreOptions { new_user_id: params.new_user_id, replace: params.replace };
    match tokio::task::spawn_blocking(move || backup::restore(&store, &body, &opts)).await {
        Ok(resp) if resp.status == "success" => Json(resp).into_response(),
        Ok(resp) => (StatusCode::BAD_REQUEST, Json(resp)).into_response(),
        Err(err) => ApiError::internal(format!("restore task failed: {}", err)).into_response(),
    }
}

async fn admin_reprocess_user(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> ApiResult<crate::episodes::ReprocessReport> {
    Ok(Json(state.episodes.reprocess_user(&user_id).await?))
}

async fn admin_reprocess_all(State(state): State<Arc<AppState>>) -> ApiResult<crate::episodes::ReprocessAllReport> {
    Ok(Json(state.episodes.reprocess_all().await?))
}
