//! HTTP surface of the orchestrator.
//!
//! Two audiences share one router: connector workers calling back through
//! the SDK endpoints during a sync, and operators driving sources and runs.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/sdk/events` | Emit a document event into the queue |
//! | `POST` | `/sdk/content` | Store an out-of-band content blob |
//! | `POST` | `/sdk/sync/{id}/heartbeat` | Advance the run's liveness clock |
//! | `POST` | `/sdk/sync/{id}/scanned` | Add to the scanned counter |
//! | `POST` | `/sdk/sync/{id}/state` | Checkpoint connector state mid-run |
//! | `POST` | `/sdk/sync/{id}/complete` | Terminal: success |
//! | `POST` | `/sdk/sync/{id}/fail` | Terminal: failure |
//! | `GET`  | `/sdk/source/{id}/sync-config` | Config + credentials + checkpoint |
//! | `POST` | `/sdk/channels` | Record a webhook channel registration |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/sources/{id}/sync` | Manual sync trigger |
//! | `POST` | `/sources/{id}/cancel` | Cancel the source's running sync |
//! | `POST` | `/webhooks/{channel_id}` | Provider push notification |
//! | `GET`  | `/sources/{id}/runs` | Recent run history |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "sync already in progress" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500). Admission conflicts (second sync for a source, a
//! concurrency ceiling) map to 409 so callers can retry later.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; workers and operator
//! dashboards call from arbitrary hosts.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::models::{EventPayload, SyncRunRow, WebhookChannelRow};
use crate::protocol::WorkerClient;
use crate::scheduler;
use crate::sources::{self, CredentialCipher, PassthroughCipher};
use crate::{content, db, embed_queue, events, runs, webhook};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    pool: sqlx::SqlitePool,
    config: Arc<Config>,
    cipher: Arc<dyn CredentialCipher>,
    /// Wakes the event dispatcher after an enqueue.
    event_notify: Arc<Notify>,
    /// Wakes the embedding worker pool after an enqueue.
    embed_notify: Arc<Notify>,
}

/// Starts the orchestrator: background loops plus the HTTP server.
///
/// Binds to the address configured in `[server].bind`. Spawns the
/// scheduler tick, stale-sync sweep, event dispatcher, embedding worker
/// pool, and webhook renewal sweep before accepting requests; all tasks
/// share the connection pool and coordinate only through the store.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_with_cipher(config, Arc::new(PassthroughCipher)).await
}

/// Like [`run_server`], but with a caller-supplied credential cipher.
/// Deployments with a real KMS-backed cipher plug it in here.
pub async fn run_server_with_cipher(
    config: &Config,
    cipher: Arc<dyn CredentialCipher>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());
    let pool = db::connect(&config).await?;

    let event_notify = Arc::new(Notify::new());
    let embed_notify = Arc::new(Notify::new());

    tokio::spawn(scheduler::run_scheduler_loop(pool.clone(), config.clone()));
    tokio::spawn(scheduler::run_stale_sweep_loop(pool.clone(), config.clone()));

    let pipeline = events::pipeline_from_config(&config.pipeline)?;
    tokio::spawn(events::run_dispatcher_loop(
        pool.clone(),
        pipeline,
        config.events.clone(),
        event_notify.clone(),
    ));

    embed_queue::spawn_workers(&pool, &config, &embed_notify)?;

    tokio::spawn(webhook::run_renewal_loop(
        pool.clone(),
        config.clone(),
        cipher.clone(),
    ));

    let state = AppState {
        pool,
        config,
        cipher,
        event_notify,
        embed_notify,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    println!("sync orchestrator listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/sdk/events", post(handle_emit_event))
        .route("/sdk/content", post(handle_store_content))
        .route("/sdk/sync/{id}/heartbeat", post(handle_heartbeat))
        .route("/sdk/sync/{id}/scanned", post(handle_scanned))
        .route("/sdk/sync/{id}/state", post(handle_save_state))
        .route("/sdk/sync/{id}/complete", post(handle_complete))
        .route("/sdk/sync/{id}/fail", post(handle_fail))
        .route("/sdk/source/{id}/sync-config", get(handle_sync_config))
        .route("/sdk/channels", post(handle_register_channel))
        .route("/health", get(handle_health))
        .route("/sources/{id}/sync", post(handle_trigger_sync))
        .route("/sources/{id}/cancel", post(handle_cancel))
        .route("/webhooks/{channel_id}", post(handle_webhook_notification))
        .route("/sources/{id}/runs", get(handle_list_runs))
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Constructs a 404 Not Found error.
fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Constructs a 409 Conflict error.
fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

/// Constructs a 500 error.
fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Inspects store-layer errors and maps them to the most appropriate
/// HTTP status code, so admission conflicts surface as 409 without a
/// custom error type threading through every function.
fn classify_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains(runs::SYNC_IN_PROGRESS)
        || msg.contains("concurrency limit")
        || msg.contains("is not running")
    {
        conflict(msg)
    } else if msg.contains("not found") || msg.contains("unknown") {
        not_found(msg)
    } else if msg.contains("not active") || msg.contains("must") {
        bad_request(msg)
    } else {
        internal(msg)
    }
}

/// Load a run and require it to be running. 404 for unknown runs,
/// 409 for terminal ones.
async fn require_running(state: &AppState, run_id: &str) -> Result<SyncRunRow, AppError> {
    let run = runs::get_run(&state.pool, run_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("sync run {} not found", run_id)))?;
    if run.status != "running" {
        return Err(conflict(format!(
            "sync run {} is not running (status: {})",
            run_id, run.status
        )));
    }
    Ok(run)
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Handler for `GET /health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /sdk/events ============

/// Request body for `POST /sdk/events`.
#[derive(Deserialize)]
struct EmitRequest {
    sync_run_id: String,
    payload: EventPayload,
}

#[derive(Serialize)]
struct EmitResponse {
    event_id: String,
}

/// Handler for `POST /sdk/events`.
///
/// Validates the run, enqueues a pending connector event, bumps the run's
/// file counters, and wakes the event dispatcher. Upserts carrying a
/// content reference also (re-)arm the document's embedding job; deletes
/// drop the document's job and stored vector.
async fn handle_emit_event(
    State(state): State<AppState>,
    Json(req): Json<EmitRequest>,
) -> Result<Json<EmitResponse>, AppError> {
    let run = require_running(&state, &req.sync_run_id).await?;

    // Resolve the content reference before any write so a bad content_id
    // rejects the whole request instead of leaving an event behind.
    let mut embed_body = None;
    if req.payload.is_upsert() {
        if let Some(content_id) = req.payload.content_id() {
            let body = content::get_content(&state.pool, content_id)
                .await
                .map_err(classify_error)?
                .ok_or_else(|| bad_request(format!("content {} not found", content_id)))?;
            embed_body = Some(body);
        }
    }

    let event_id = events::enqueue_event(
        &state.pool,
        &run.id,
        &run.source_id,
        &req.payload,
        state.config.events.max_retries,
    )
    .await
    .map_err(classify_error)?;

    runs::record_emit(&state.pool, &run.id, req.payload.is_upsert())
        .await
        .map_err(classify_error)?;

    if req.payload.is_upsert() {
        if let Some(body) = embed_body {
            embed_queue::enqueue_job(
                &state.pool,
                &run.source_id,
                req.payload.document_id(),
                &body,
                state.config.events.max_retries,
            )
            .await
            .map_err(classify_error)?;
            state.embed_notify.notify_one();
        }
    } else {
        embed_queue::drop_document(&state.pool, req.payload.document_id())
            .await
            .map_err(classify_error)?;
    }

    state.event_notify.notify_one();
    Ok(Json(EmitResponse { event_id }))
}

// ============ POST /sdk/content ============

/// Request body for `POST /sdk/content`.
#[derive(Deserialize)]
struct StoreContentRequest {
    sync_run_id: String,
    body: String,
}

#[derive(Serialize)]
struct StoreContentResponse {
    content_id: String,
}

/// Handler for `POST /sdk/content`.
///
/// Content ids are content-addressed, so re-storing the same body from a
/// retried sync is a no-op that returns the same id.
async fn handle_store_content(
    State(state): State<AppState>,
    Json(req): Json<StoreContentRequest>,
) -> Result<Json<StoreContentResponse>, AppError> {
    let run = require_running(&state, &req.sync_run_id).await?;
    let content_id = content::store_content(&state.pool, &run.id, &run.source_id, &req.body)
        .await
        .map_err(classify_error)?;
    runs::touch(&state.pool, &run.id).await.map_err(classify_error)?;
    Ok(Json(StoreContentResponse { content_id }))
}

// ============ POST /sdk/sync/{id}/* ============

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

/// Handler for `POST /sdk/sync/{id}/heartbeat`.
async fn handle_heartbeat(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<OkResponse>, AppError> {
    require_running(&state, &run_id).await?;
    runs::touch(&state.pool, &run_id).await.map_err(classify_error)?;
    Ok(Json(OkResponse { ok: true }))
}

/// Request body for `POST /sdk/sync/{id}/scanned`.
#[derive(Deserialize)]
struct ScannedRequest {
    count: i64,
}

/// Handler for `POST /sdk/sync/{id}/scanned`.
async fn handle_scanned(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<ScannedRequest>,
) -> Result<Json<OkResponse>, AppError> {
    if req.count < 0 {
        return Err(bad_request("count must be >= 0"));
    }
    require_running(&state, &run_id).await?;
    runs::increment_scanned(&state.pool, &run_id, req.count)
        .await
        .map_err(classify_error)?;
    Ok(Json(OkResponse { ok: true }))
}

/// Request body for `POST /sdk/sync/{id}/state`.
#[derive(Deserialize)]
struct SaveStateRequest {
    state: serde_json::Value,
}

/// Handler for `POST /sdk/sync/{id}/state`.
///
/// Mid-run checkpoint: a worker that saves state after each page loses at
/// most one page of progress to a crash.
async fn handle_save_state(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<SaveStateRequest>,
) -> Result<Json<OkResponse>, AppError> {
    let run = require_running(&state, &run_id).await?;
    sources::save_connector_state(&state.pool, &run.source_id, &req.state)
        .await
        .map_err(classify_error)?;
    runs::touch(&state.pool, &run_id).await.map_err(classify_error)?;
    Ok(Json(OkResponse { ok: true }))
}

/// Request body for `POST /sdk/sync/{id}/complete`.
#[derive(Deserialize)]
struct CompleteRequest {
    documents_scanned: i64,
    documents_updated: i64,
    #[serde(default)]
    new_state: Option<serde_json::Value>,
}

/// Handler for `POST /sdk/sync/{id}/complete`.
async fn handle_complete(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<OkResponse>, AppError> {
    // Look the run up first: an unknown id is 404, not a 409 dressed up
    // as "not running".
    require_running(&state, &run_id).await?;
    runs::complete_run(
        &state.pool,
        &run_id,
        req.documents_scanned,
        req.documents_updated,
        req.new_state.as_ref(),
    )
    .await
    .map_err(classify_error)?;
    Ok(Json(OkResponse { ok: true }))
}

/// Request body for `POST /sdk/sync/{id}/fail`.
#[derive(Deserialize)]
struct FailRequest {
    error: String,
}

/// Handler for `POST /sdk/sync/{id}/fail`.
///
/// Events already emitted by the failed run stay queued; partial progress
/// is delivered, not rolled back.
async fn handle_fail(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Result<Json<OkResponse>, AppError> {
    require_running(&state, &run_id).await?;
    runs::fail_run(&state.pool, &run_id, &req.error)
        .await
        .map_err(classify_error)?;
    Ok(Json(OkResponse { ok: true }))
}

// ============ GET /sdk/source/{id}/sync-config ============

/// Handler for `GET /sdk/source/{id}/sync-config`.
///
/// Returns the non-secret connector config, the opened credentials, and
/// the last saved connector state. Workers fetch this at the start of
/// every sync rather than caching credentials.
async fn handle_sync_config(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> Result<Json<sources::SyncConfig>, AppError> {
    let cfg = sources::sync_config(&state.pool, state.cipher.as_ref(), &source_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("source {} not found", source_id)))?;
    Ok(Json(cfg))
}

// ============ POST /sdk/channels ============

/// Request body for `POST /sdk/channels`.
#[derive(Deserialize)]
struct RegisterChannelRequest {
    source_id: String,
    channel_id: String,
    resource_id: String,
    expires_at: i64,
}

/// Handler for `POST /sdk/channels`.
///
/// Workers report provider channel registrations here so the renewal
/// sweep can keep them alive.
async fn handle_register_channel(
    State(state): State<AppState>,
    Json(req): Json<RegisterChannelRequest>,
) -> Result<Json<WebhookChannelRow>, AppError> {
    sources::get_source(&state.pool, &req.source_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("source {} not found", req.source_id)))?;
    if req.expires_at <= crate::models::now_ts() {
        return Err(bad_request("expires_at must be in the future"));
    }
    let row = webhook::register_channel(
        &state.pool,
        &req.source_id,
        &req.channel_id,
        &req.resource_id,
        req.expires_at,
    )
    .await
    .map_err(classify_error)?;
    Ok(Json(row))
}

// ============ POST /sources/{id}/sync ============

/// Request body for `POST /sources/{id}/sync`. The body is optional;
/// an empty POST triggers the default incremental-if-possible sync.
#[derive(Deserialize, Default)]
struct TriggerSyncRequest {
    #[serde(default)]
    full: bool,
}

#[derive(Serialize)]
struct TriggerSyncResponse {
    sync_run_id: String,
    sync_type: String,
}

/// Handler for `POST /sources/{id}/sync`: manual trigger through the same
/// admission path as the scheduler. 409 when a run is already in progress
/// or a concurrency ceiling is hit.
async fn handle_trigger_sync(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    body: Option<Json<TriggerSyncRequest>>,
) -> Result<Json<TriggerSyncResponse>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let source = sources::get_source(&state.pool, &source_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("source {} not found", source_id)))?;

    let sync_type = scheduler::sync_type_for(&source, req.full);
    let run = runs::start_run(
        &state.pool,
        &state.config.scheduler,
        &source,
        crate::models::TriggerType::Manual,
        sync_type,
    )
    .await
    .map_err(classify_error)?;

    scheduler::spawn_dispatch(state.pool.clone(), state.config.clone(), source, run.clone());

    Ok(Json(TriggerSyncResponse {
        sync_run_id: run.id,
        sync_type: sync_type.as_str().to_string(),
    }))
}

// ============ POST /sources/{id}/cancel ============

/// Handler for `POST /sources/{id}/cancel`.
///
/// The cancel signal to the worker is best effort; the run is marked
/// cancelled regardless, and the stale sweep backstops a worker that
/// never noticed.
async fn handle_cancel(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> Result<Json<OkResponse>, AppError> {
    let source = sources::get_source(&state.pool, &source_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("source {} not found", source_id)))?;
    let run = runs::running_run_for_source(&state.pool, &source_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| conflict(format!("source {} has no running sync", source_id)))?;

    if let Ok(connector) = state.config.worker_for(&source.source_type) {
        if let Ok(worker) = WorkerClient::for_connector(connector) {
            if let Err(e) = worker.cancel(&run.id).await {
                eprintln!("cancel signal to {} worker failed: {}", source.source_type, e);
            }
        }
    }

    runs::cancel_run(&state.pool, &run.id)
        .await
        .map_err(classify_error)?;
    Ok(Json(OkResponse { ok: true }))
}

// ============ POST /webhooks/{channel_id} ============

#[derive(Serialize)]
struct WebhookResponse {
    sync_run_id: String,
}

/// Handler for `POST /webhooks/{channel_id}`: provider push notification.
///
/// Unknown or expired channels are rejected with no side effects. A valid
/// notification starts an incremental webhook-triggered run through the
/// standard admission path; a 409 here means a run is already picking up
/// the change.
async fn handle_webhook_notification(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Result<Json<WebhookResponse>, AppError> {
    let channel = webhook::resolve_channel(&state.pool, &channel_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("webhook channel {} not found", channel_id)))?;
    let source = sources::get_source(&state.pool, &channel.source_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("source {} not found", channel.source_id)))?;

    let sync_type = scheduler::sync_type_for(&source, false);
    let run = runs::start_run(
        &state.pool,
        &state.config.scheduler,
        &source,
        crate::models::TriggerType::Webhook,
        sync_type,
    )
    .await
    .map_err(classify_error)?;

    scheduler::spawn_dispatch(state.pool.clone(), state.config.clone(), source, run.clone());

    Ok(Json(WebhookResponse { sync_run_id: run.id }))
}

// ============ GET /sources/{id}/runs ============

#[derive(Serialize)]
struct RunListResponse {
    runs: Vec<SyncRunRow>,
}

/// Handler for `GET /sources/{id}/runs`: most recent runs first.
async fn handle_list_runs(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> Result<Json<RunListResponse>, AppError> {
    sources::get_source(&state.pool, &source_id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("source {} not found", source_id)))?;
    let runs = runs::list_recent_runs(&state.pool, &source_id, 20)
        .await
        .map_err(classify_error)?;
    Ok(Json(RunListResponse { runs }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use crate::models::SourceType;
    use crate::testutil::seed_source;
    use tempfile::TempDir;

    async fn test_state() -> (TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::minimal();
        config.db.path = dir.path().join("syncd.sqlite");
        let config = Arc::new(config);
        let pool = db::connect(&config).await.unwrap();
        apply_schema(&pool).await.unwrap();
        let state = AppState {
            pool,
            config,
            cipher: Arc::new(PassthroughCipher),
            event_notify: Arc::new(Notify::new()),
            embed_notify: Arc::new(Notify::new()),
        };
        (dir, state)
    }

    async fn serve(state: AppState) -> String {
        let app = router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (_dir, state) = test_state().await;
        let base = serve(state).await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn emit_for_unknown_run_is_404() {
        let (_dir, state) = test_state().await;
        let base = serve(state).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/sdk/events", base))
            .json(&serde_json::json!({
                "sync_run_id": "missing",
                "payload": {"type": "document_deleted", "document_id": "d"}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn emit_for_terminal_run_is_409() {
        let (_dir, state) = test_state().await;
        let pool = state.pool.clone();
        let source = seed_source(&pool, SourceType::Drive).await;
        let run = runs::start_run(
            &pool,
            &state.config.scheduler,
            &source,
            crate::models::TriggerType::Manual,
            crate::models::SyncType::Full,
        )
        .await
        .unwrap();
        runs::fail_run(&pool, &run.id, "boom").await.unwrap();

        let base = serve(state).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/sdk/events", base))
            .json(&serde_json::json!({
                "sync_run_id": run.id,
                "payload": {"type": "document_deleted", "document_id": "d"}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    }

    #[tokio::test]
    async fn complete_for_unknown_run_is_404() {
        let (_dir, state) = test_state().await;
        let base = serve(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/sdk/sync/no-such-run/complete", base))
            .json(&serde_json::json!({"documents_scanned": 1, "documents_updated": 0}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!("{}/sdk/sync/no-such-run/fail", base))
            .json(&serde_json::json!({"error": "boom"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn emit_with_missing_content_leaves_no_event_behind() {
        let (_dir, state) = test_state().await;
        let pool = state.pool.clone();
        let source = seed_source(&pool, SourceType::Drive).await;
        let run = runs::start_run(
            &pool,
            &state.config.scheduler,
            &source,
            crate::models::TriggerType::Manual,
            crate::models::SyncType::Full,
        )
        .await
        .unwrap();

        let base = serve(state).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/sdk/events", base))
            .json(&serde_json::json!({
                "sync_run_id": run.id,
                "payload": {
                    "type": "document_created",
                    "document_id": "d1",
                    "content_id": "no-such-content"
                }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // The rejected request wrote nothing: no event row, no counters
        let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM connector_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(events, 0);
        let fresh = runs::get_run(&pool, &run.id).await.unwrap().unwrap();
        assert_eq!(fresh.files_processed, 0);
    }

    #[tokio::test]
    async fn unknown_webhook_channel_is_404_with_no_run() {
        let (_dir, state) = test_state().await;
        let pool = state.pool.clone();
        let base = serve(state).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/webhooks/ghost-channel", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_runs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn valid_webhook_notification_starts_webhook_run() {
        let (_dir, state) = test_state().await;
        let pool = state.pool.clone();
        let source = seed_source(&pool, SourceType::Drive).await;
        webhook::register_channel(
            &pool,
            &source.id,
            "chan-1",
            "res-1",
            crate::models::now_ts() + 600,
        )
        .await
        .unwrap();

        let base = serve(state).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/webhooks/chan-1", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        let run_id = body["sync_run_id"].as_str().unwrap();

        let run = runs::get_run(&pool, run_id).await.unwrap().unwrap();
        assert_eq!(run.trigger_type, "webhook");
        assert_eq!(run.source_id, source.id);
    }

    #[tokio::test]
    async fn second_manual_trigger_conflicts() {
        let (_dir, state) = test_state().await;
        let pool = state.pool.clone();
        let source = seed_source(&pool, SourceType::Wiki).await;
        let base = serve(state).await;
        let client = reqwest::Client::new();

        let first = client
            .post(format!("{}/sources/{}/sync", base, source.id))
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 200);
        let body: serde_json::Value = first.json().await.unwrap();
        assert_eq!(body["sync_type"], "full");

        let second = client
            .post(format!("{}/sources/{}/sync", base, source.id))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 409);
        let body: serde_json::Value = second.json().await.unwrap();
        assert_eq!(body["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn sync_config_roundtrip_over_http() {
        let (_dir, state) = test_state().await;
        let pool = state.pool.clone();
        let cipher = PassthroughCipher;
        let blob = cipher.seal(&serde_json::json!({"token": "t"})).unwrap();
        let source = sources::add_source(
            &pool,
            SourceType::Crm,
            "crm",
            r#"{"realm": "acme"}"#,
            Some(&blob),
            3600,
        )
        .await
        .unwrap();

        let base = serve(state).await;
        let body: serde_json::Value =
            reqwest::get(format!("{}/sdk/source/{}/sync-config", base, source.id))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(body["config"]["realm"], "acme");
        assert_eq!(body["credentials"]["token"], "t");
    }
}
