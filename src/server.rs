//! HTTP surface for producers and operators.
//!
//! The server also runs the sync worker in the background, and resumes a
//! reindex job left unfinished by a previous process.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/sync-requests` | Enqueue a sync request → `202` |
//! | `POST` | `/reindex` | Trigger a rebuild → `202` new job, `200` existing job |
//! | `GET`  | `/reindex/{id}` | Reindex job status |
//! | `POST` | `/search` | Multi-slice query against the current index |
//! | `GET`  | `/status` | Pointer, queue depth, recent syncs, latest reindex |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "index_id must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::future::Future;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use kb_sync_core::models::{ReindexJob, SyncRequest};
use kb_sync_core::store::{JobStore, TriggerOutcome};

use crate::app::App;
use crate::queue::EnqueueOutcome;
use crate::reindex::ReindexError;
use crate::search::{search_current, SearchResponse};
use crate::status::{collect_status, StatusReport};

/// Bind `[server].bind` and serve until Ctrl-C.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "kb-sync server listening");
    println!("kb-sync server listening on http://{}", bind_addr);

    serve(app, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Serve on `listener` until `shutdown` resolves, with the sync worker
/// running alongside.
pub async fn serve<F>(app: App, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);

    let worker = app.worker();
    let mut worker_stop = stop_rx.clone();
    let worker_task = tokio::spawn(async move {
        worker
            .run(async move {
                let _ = worker_stop.wait_for(|stop| *stop).await;
            })
            .await
    });

    if let Some(job) = app.store.active_reindex_job().await? {
        tracing::info!(execution_id = %job.execution_id, status = %job.status, "resuming reindex");
        spawn_drive(&app, job.execution_id);
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = router(app).layer(cors);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        })
        .await?;

    worker_task.await??;
    Ok(())
}

pub fn router(app: App) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/sync-requests", post(handle_enqueue))
        .route("/reindex", post(handle_trigger_reindex))
        .route("/reindex/{id}", get(handle_reindex_status))
        .route("/search", post(handle_search))
        .route("/status", get(handle_status))
        .with_state(app)
}

fn spawn_drive(app: &App, execution_id: String) {
    let orchestrator = app.orchestrator();
    tokio::spawn(async move {
        match orchestrator.drive(&execution_id).await {
            Ok(job) => tracing::info!(
                execution_id = %execution_id,
                summary = %job.summary(),
                "reindex finished"
            ),
            Err(e) => tracing::error!(
                execution_id = %execution_id,
                error = %e,
                kind = e.kind().as_str(),
                "reindex stopped"
            ),
        }
    });
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: format!("{:#}", err),
        }
    }
}

impl From<ReindexError> for AppError {
    fn from(err: ReindexError) -> Self {
        match err {
            ReindexError::UnknownJob(_) => not_found(err.to_string()),
            other => anyhow::Error::new(other).into(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /sync-requests ============

#[derive(Deserialize)]
struct EnqueueRequest {
    index_id: String,
    /// Defaults to the time the request is received.
    #[serde(default)]
    requested_at: Option<DateTime<Utc>>,
}

async fn handle_enqueue(
    State(app): State<App>,
    Json(body): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueOutcome>), AppError> {
    if body.index_id.trim().is_empty() {
        return Err(bad_request("index_id must not be empty"));
    }
    let request = SyncRequest::new(body.index_id, body.requested_at.unwrap_or_else(Utc::now));
    let outcome = app.queue.enqueue(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

// ============ /reindex ============

#[derive(Serialize)]
struct ReindexResponse {
    created: bool,
    summary: String,
    job: ReindexJob,
}

impl ReindexResponse {
    fn new(created: bool, job: ReindexJob) -> Self {
        Self {
            created,
            summary: job.summary(),
            job,
        }
    }
}

async fn handle_trigger_reindex(
    State(app): State<App>,
) -> Result<(StatusCode, Json<ReindexResponse>), AppError> {
    match app.orchestrator().trigger().await? {
        TriggerOutcome::Created(job) => {
            spawn_drive(&app, job.execution_id.clone());
            Ok((StatusCode::ACCEPTED, Json(ReindexResponse::new(true, job))))
        }
        TriggerOutcome::Existing(job) => Ok((StatusCode::OK, Json(ReindexResponse::new(false, job)))),
    }
}

async fn handle_reindex_status(
    State(app): State<App>,
    Path(id): Path<String>,
) -> Result<Json<ReindexResponse>, AppError> {
    let job = app.orchestrator().status(&id).await?;
    Ok(Json(ReindexResponse::new(false, job)))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_search(
    State(app): State<App>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let retrieval = &app.config.retrieval;
    let limit = body.limit.unwrap_or(retrieval.final_limit);
    if limit == 0 {
        return Err(bad_request("limit must be at least 1"));
    }
    let response = search_current(
        app.backend.as_ref(),
        app.store.as_ref(),
        &retrieval.slices(),
        &body.query,
        limit,
        retrieval.candidate_k,
    )
    .await?;
    Ok(Json(response))
}

// ============ GET /status ============

async fn handle_status(State(app): State<App>) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(collect_status(&app).await?))
}
