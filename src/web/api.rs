use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use super::server::WebState;
use crate::git::ops::{self, CommitOutcome, RepoStatus, RepoStatusEntry};
use crate::session::registry::{DeleteReport, StartSpec};
use crate::session::{Group, Session};
use crate::status::StatusRecord;

/// API routes
pub fn api_routes() -> Router<Arc<WebState>> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(start_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session).patch(update_session),
        )
        .route("/api/sessions/{id}/fork", post(fork_session))
        .route("/api/sessions/{id}/input", post(send_input))
        .route("/api/sessions/{id}/scrollback", get(scrollback))
        .route("/api/status", get(status_snapshot))
        .route("/api/groups", get(list_groups).post(create_group).delete(delete_group))
        .route("/api/git/status", get(git_status))
        .route("/api/git/status/aggregate", post(git_aggregate_status))
        .route("/api/git/diff", get(git_diff))
        .route("/api/git/stage", post(git_stage))
        .route("/api/git/unstage", post(git_unstage))
        .route("/api/git/discard", post(git_discard))
        .route("/api/git/commit", post(git_commit))
        .route("/api/git/push", post(git_push))
}

type ApiResult<T> = Result<Json<T>, Response>;

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
    pub lines: Option<u32>,
    pub repo: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub staged: bool,
}

/// Verify the auth token from the query string
fn authorize(state: &WebState, token: Option<&str>) -> Result<(), Response> {
    if token.map_or(false, |t| t == state.token) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN.into_response())
    }
}

fn reject(e: crate::error::Error) -> Response {
    e.into_response()
}

// ── Sessions ─────────────────────────────────────────────────

async fn list_sessions(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Vec<Session>> {
    authorize(&state, query.token.as_deref())?;
    Ok(Json(state.registry.list().await))
}

async fn start_session(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(spec): Json<StartSpec>,
) -> ApiResult<Session> {
    authorize(&state, query.token.as_deref())?;
    state.registry.start(spec).await.map(Json).map_err(reject)
}

async fn get_session(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(id): Path<String>,
) -> ApiResult<Session> {
    authorize(&state, query.token.as_deref())?;
    state.registry.get(&id).await.map(Json).map_err(reject)
}

async fn delete_session(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(id): Path<String>,
) -> ApiResult<DeleteReport> {
    authorize(&state, query.token.as_deref())?;
    state.registry.delete(&id).await.map(Json).map_err(reject)
}

#[derive(Deserialize)]
pub struct ForkRequest {
    pub name: Option<String>,
}

async fn fork_session(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(id): Path<String>,
    Json(body): Json<ForkRequest>,
) -> ApiResult<Session> {
    authorize(&state, query.token.as_deref())?;
    state
        .registry
        .fork(&id, body.name)
        .await
        .map(Json)
        .map_err(reject)
}

#[derive(Deserialize)]
pub struct SendInputRequest {
    pub text: String,
    #[serde(default)]
    pub press_enter: bool,
}

async fn send_input(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(id): Path<String>,
    Json(body): Json<SendInputRequest>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, query.token.as_deref())?;
    state
        .registry
        .send_text(&id, &body.text, body.press_enter)
        .await
        .map(|_| Json(serde_json::json!({ "ok": true })))
        .map_err(reject)
}

#[derive(Deserialize)]
pub struct UpdateSessionRequest {
    pub name: Option<String>,
    pub group_path: Option<String>,
}

async fn update_session(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(id): Path<String>,
    Json(body): Json<UpdateSessionRequest>,
) -> ApiResult<Session> {
    authorize(&state, query.token.as_deref())?;

    let mut session = state.registry.get(&id).await.map_err(reject)?;
    if let Some(name) = body.name.as_deref() {
        session = state.registry.rename(&id, name).await.map_err(reject)?;
    }
    if let Some(group) = body.group_path.as_deref() {
        session = state
            .registry
            .move_to_group(&id, group)
            .await
            .map_err(reject)?;
    }
    Ok(Json(session))
}

async fn scrollback(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, query.token.as_deref())?;
    let lines = query.lines.unwrap_or(state.settings.poll.capture_lines);
    state
        .registry
        .scrollback(&id, lines)
        .await
        .map(|text| Json(serde_json::json!({ "scrollback": text })))
        .map_err(reject)
}

async fn status_snapshot(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Vec<StatusRecord>> {
    authorize(&state, query.token.as_deref())?;
    let snapshot = state.status_rx.borrow().as_ref().clone();
    Ok(Json(snapshot))
}

// ── Groups ───────────────────────────────────────────────────

async fn list_groups(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Vec<Group>> {
    authorize(&state, query.token.as_deref())?;
    Ok(Json(state.store.list_groups().await))
}

#[derive(Deserialize)]
pub struct GroupRequest {
    pub path: String,
}

async fn create_group(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(body): Json<GroupRequest>,
) -> ApiResult<Group> {
    authorize(&state, query.token.as_deref())?;
    state
        .store
        .create_group(&body.path)
        .await
        .map(Json)
        .map_err(reject)
}

async fn delete_group(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(body): Json<GroupRequest>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, query.token.as_deref())?;
    state
        .store
        .delete_group(&body.path)
        .await
        .map(|_| Json(serde_json::json!({ "ok": true })))
        .map_err(reject)
}

// ── Git ──────────────────────────────────────────────────────

fn repo_from(query: &TokenQuery) -> Result<PathBuf, Response> {
    query
        .repo
        .as_deref()
        .map(PathBuf::from)
        .ok_or_else(|| reject(crate::error::Error::Validation("repo is required".into())))
}

async fn git_status(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<RepoStatus> {
    authorize(&state, query.token.as_deref())?;
    let repo = repo_from(&query)?;
    ops::status(&repo).await.map(Json).map_err(reject)
}

#[derive(Deserialize)]
pub struct AggregateRequest {
    pub repos: Vec<String>,
}

async fn git_aggregate_status(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(body): Json<AggregateRequest>,
) -> ApiResult<Vec<RepoStatusEntry>> {
    authorize(&state, query.token.as_deref())?;
    Ok(Json(ops::aggregate_status(&body.repos).await))
}

async fn git_diff(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, query.token.as_deref())?;
    let repo = repo_from(&query)?;
    ops::diff(&repo, query.path.as_deref(), query.staged)
        .await
        .map(|diff| Json(serde_json::json!({ "diff": diff })))
        .map_err(reject)
}

#[derive(Deserialize)]
pub struct PathsRequest {
    pub repo: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

async fn git_stage(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(body): Json<PathsRequest>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, query.token.as_deref())?;
    ops::stage(&PathBuf::from(&body.repo), &body.paths)
        .await
        .map(|_| Json(serde_json::json!({ "ok": true })))
        .map_err(reject)
}

async fn git_unstage(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(body): Json<PathsRequest>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, query.token.as_deref())?;
    ops::unstage(&PathBuf::from(&body.repo), &body.paths)
        .await
        .map(|_| Json(serde_json::json!({ "ok": true })))
        .map_err(reject)
}

async fn git_discard(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(body): Json<PathsRequest>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, query.token.as_deref())?;
    ops::discard(&PathBuf::from(&body.repo), &body.paths)
        .await
        .map(|_| Json(serde_json::json!({ "ok": true })))
        .map_err(reject)
}

#[derive(Deserialize)]
pub struct CommitRequest {
    pub repo: String,
    pub message: String,
}

async fn git_commit(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(body): Json<CommitRequest>,
) -> ApiResult<CommitOutcome> {
    authorize(&state, query.token.as_deref())?;
    ops::commit(
        &PathBuf::from(&body.repo),
        &body.message,
        &state.settings.git.protected_branches,
    )
    .await
    .map(Json)
    .map_err(reject)
}

#[derive(Deserialize)]
pub struct PushRequest {
    pub repo: String,
}

async fn git_push(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(body): Json<PushRequest>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, query.token.as_deref())?;
    ops::push(&PathBuf::from(&body.repo))
        .await
        .map(|_| Json(serde_json::json!({ "ok": true })))
        .map_err(reject)
}
