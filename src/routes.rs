//! HTTP route wiring (spec §6 "Routes (representative subset)").
//!
//! Mirrors the teacher's `server.rs` in shape — one `Router` built from a
//! flat list of `.route(...)` calls plus a shared state extension — but
//! every handler here is a thin translation from an axum extractor to a
//! [`crate::title`]/[`crate::version`]/[`crate::release`] workflow call.
//! `axum::middleware::from_fn_with_state` wires [`crate::auth::authorize`]
//! in front of the whole router, matching spec §6's "every route is
//! authorized the same way" design.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Extension, Multipart, Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::auth::{authorize, AuthenticatedAdmin};
use crate::error::{Res, XoloError};
use crate::progress::tail_progress_file;
use crate::state::{AppState, StateSnapshot};
use crate::title::{Actor, NewTitle};
use crate::types::{Title, Version};
use crate::version::NewVersion;

/// Builds the `Actor` a workflow needs for changelog attribution out of the
/// identity the auth middleware attached and (when available) the caller's
/// source address.
fn actor_from(admin: &AuthenticatedAdmin, addr: Option<ConnectInfo<SocketAddr>>) -> Actor {
    Actor {
        admin: admin.username.clone(),
        host: addr.map(|ConnectInfo(a)| a.ip().to_string()).unwrap_or_else(|| "unknown".to_string()),
    }
}

#[derive(Serialize)]
struct Ack {
    status: &'static str,
}

const ACK: Ack = Ack { status: "ok" };

/// spec §6: "successful long-running operations respond `{status: "running",
/// progress_stream_url_path}`".
#[derive(Serialize)]
struct Running {
    status: &'static str,
    progress_stream_url_path: String,
}

async fn ping() -> &'static str {
    "pong"
}

#[derive(Deserialize)]
struct StreamQuery {
    stream_file: String,
}

/// spec §6 `GET /streamed_progress/?stream_file=<path>`: tails the named
/// progress file and forwards each line as an SSE event until the
/// completion sentinel (or the worker going quiet) ends the stream.
async fn streamed_progress(Query(q): Query<StreamQuery>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(tail_progress_file(PathBuf::from(q.stream_file), tx, Duration::from_secs(60)));
    let stream = ReceiverStream::new(rx).map(|line| Ok(Event::default().data(line)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
}

/// spec §6 `POST /auth/login`: validates credentials against Fleet's
/// identity provider. The bearer token returned is a placeholder scheme
/// (`"session:<username>"`) standing in for a real session store — see
/// [`crate::auth::session_username_from_request`].
async fn auth_login(State(state): State<Arc<AppState>>, Json(req): Json<LoginRequest>) -> Res<Json<LoginResponse>> {
    let ok = state.fleet.authenticate(&req.username, &req.password).await?;
    if !ok {
        return Err(XoloError::Unauthorized);
    }
    Ok(Json(LoginResponse {
        token: format!("session:{}", req.username),
    }))
}

async fn titles_create(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Json(new): Json<NewTitle>,
) -> Res<Json<Title>> {
    let actor = actor_from(&admin, addr);
    Ok(Json(state.titles.create(new, &actor).await?))
}

async fn titles_update(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path(slug): Path<String>,
    Json(incoming): Json<Title>,
) -> Res<Json<Title>> {
    let actor = actor_from(&admin, addr);
    Ok(Json(state.titles.update(&slug, incoming, &actor).await?))
}

async fn titles_delete(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path(slug): Path<String>,
) -> Res<Json<Ack>> {
    let actor = actor_from(&admin, addr);
    state.titles.delete(&slug, &actor).await?;
    Ok(Json(ACK))
}

async fn versions_create(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path(slug): Path<String>,
    Json(new): Json<NewVersion>,
) -> Res<Json<Version>> {
    let actor = actor_from(&admin, addr);
    Ok(Json(state.versions.create(&slug, new, &actor).await?))
}

async fn versions_update(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path((slug, _version)): Path<(String, String)>,
    Json(incoming): Json<Version>,
) -> Res<Json<Version>> {
    let actor = actor_from(&admin, addr);
    Ok(Json(state.versions.update(&slug, incoming, &actor).await?))
}

async fn versions_delete(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path((slug, version)): Path<(String, String)>,
) -> Res<Json<Ack>> {
    let actor = actor_from(&admin, addr);
    state.versions.delete(&slug, &version, &actor).await?;
    Ok(Json(ACK))
}

#[derive(Deserialize)]
struct ReleaseRequest {
    target: String,
    /// Caller-supplied per spec §9 open question (b): this workflow never
    /// infers rollback from `version_order` position itself.
    rollback: bool,
}

async fn release_title(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path(slug): Path<String>,
    Json(req): Json<ReleaseRequest>,
) -> Res<Json<Title>> {
    let actor = actor_from(&admin, addr);
    Ok(Json(state.releases.release(&slug, &req.target, req.rollback, &actor).await?))
}

#[derive(Deserialize)]
struct HostRequest {
    host: String,
}

async fn freeze_title(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path(slug): Path<String>,
    Json(req): Json<HostRequest>,
) -> Res<Json<Ack>> {
    let actor = actor_from(&admin, addr);
    state.titles.freeze(&slug, &req.host, &actor).await?;
    Ok(Json(ACK))
}

async fn thaw_title(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Path(slug): Path<String>,
    Json(req): Json<HostRequest>,
) -> Res<Json<Ack>> {
    let actor = actor_from(&admin, addr);
    state.titles.thaw(&slug, &req.host, &actor).await?;
    Ok(Json(ACK))
}

/// Reads the first multipart field's filename and bytes. Upload handlers
/// only ever expect a single file field (spec §6 `/uploads/icon`,
/// `/uploads/pkg`).
async fn first_field(mut multipart: Multipart) -> Res<(Option<String>, Vec<u8>)> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| XoloError::InvalidData(format!("malformed multipart body: {e}")))?
        .ok_or_else(|| XoloError::InvalidData("multipart body has no fields".to_string()))?;
    let filename = field.file_name().map(|s| s.to_string());
    let bytes = field
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| XoloError::InvalidData(format!("failed to read upload field: {e}")))?;
    Ok((filename, bytes))
}

async fn first_field_bytes(multipart: Multipart) -> Res<Vec<u8>> {
    first_field(multipart).await.map(|(_, bytes)| bytes)
}

/// The icon's on-disk extension (spec §4.1 `self-service-icon.<ext>`),
/// taken from the uploaded filename; falls back to `png` when the upload
/// carries no filename or no extension.
fn icon_extension(filename: Option<&str>) -> String {
    filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "png".to_string())
}

#[derive(Deserialize)]
struct UploadIconQuery {
    title: String,
}

async fn upload_icon(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UploadIconQuery>,
    multipart: Multipart,
) -> Res<Json<Ack>> {
    let (filename, bytes) = first_field(multipart).await?;
    let ext = icon_extension(filename.as_deref());
    state.store.save_icon(&q.title, &ext, &bytes).await?;
    Ok(Json(ACK))
}

#[derive(Deserialize)]
struct UploadPkgQuery {
    title: String,
    version: String,
}

async fn upload_pkg(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UploadPkgQuery>,
    multipart: Multipart,
) -> Res<Json<Ack>> {
    let bytes = first_field_bytes(multipart).await?;
    state.store.save_package(&q.title, &q.version, &bytes).await?;
    Ok(Json(ACK))
}

/// Forces an out-of-band cleanup sweep, regardless of the gating hour/cooldown
/// the Scheduler's own timer normally applies. Runs as a progress-streamed
/// workflow since a full sweep can take longer than one request's response
/// cycle (spec §4.3). Shared by `/cleanup` (the operator-facing admin route)
/// and `/maint/cleanup-internal` (the loopback route the scheduler itself
/// posts to per spec §4.8).
async fn run_forced_cleanup(state: &Arc<AppState>) -> Running {
    let scheduler = Arc::clone(&state.scheduler);
    let path = state
        .progress
        .spawn("cleanup", |handle| async move {
            handle.progress("starting forced cleanup", None).await;
            match scheduler.maybe_run_cleanup(Utc::now(), true).await {
                Ok(ran) => handle.progress(format!("cleanup finished (ran={ran})"), None).await,
                Err(e) => handle.error(format!("cleanup failed: {e}")).await,
            }
            handle.complete().await;
        })
        .await;
    Running {
        status: "running",
        progress_stream_url_path: format!("/streamed_progress/?stream_file={}", path.display()),
    }
}

async fn cleanup(State(state): State<Arc<AppState>>) -> Json<Running> {
    Json(run_forced_cleanup(&state).await)
}

async fn maint_cleanup_internal(State(state): State<Arc<AppState>>) -> Json<Running> {
    Json(run_forced_cleanup(&state).await)
}

/// spec §6 `SERVER_ADMIN_ROUTES` `/update-client-data`: forces an immediate
/// client-data rebuild/upload outside the Scheduler's own cadence.
async fn update_client_data(State(state): State<Arc<AppState>>) -> Res<Json<Ack>> {
    state.client_data.build_and_upload().await?;
    Ok(Json(ACK))
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Json<StateSnapshot> {
    Json(state.state_snapshot().await)
}

async fn rotate_logs(State(state): State<Arc<AppState>>, Extension(admin): Extension<AuthenticatedAdmin>) -> Json<Ack> {
    info!(admin = %admin.username, log_dir = %state.log_control.log_dir().display(), "log rotation requested");
    Json(ACK)
}

#[derive(Deserialize)]
struct SetLogLevelRequest {
    directive: String,
}

async fn set_log_level(State(state): State<Arc<AppState>>, Json(req): Json<SetLogLevelRequest>) -> Res<Json<Ack>> {
    state
        .log_control
        .set_level(&req.directive)
        .map_err(XoloError::InvalidData)?;
    Ok(Json(ACK))
}

pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/streamed_progress/", get(streamed_progress))
        .route("/auth/login", post(auth_login))
        .route("/titles", post(titles_create))
        .route("/titles/{slug}", put(titles_update).delete(titles_delete))
        .route("/titles/{slug}/versions", post(versions_create))
        .route(
            "/titles/{slug}/versions/{version}",
            put(versions_update).delete(versions_delete),
        )
        .route("/titles/{slug}/release", post(release_title))
        .route("/titles/{slug}/freeze", post(freeze_title))
        .route("/titles/{slug}/thaw", post(thaw_title))
        .route("/uploads/icon", post(upload_icon))
        .route("/uploads/pkg", post(upload_pkg))
        .route("/maint/cleanup-internal", post(maint_cleanup_internal))
        .route("/cleanup", post(cleanup))
        .route("/update-client-data", post(update_client_data))
        .route("/state", get(state_handler))
        .route("/rotate-logs", post(rotate_logs))
        .route("/set-log-level", post(set_log_level))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), authorize))
        .with_state(state)
}
