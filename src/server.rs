//! HTTP server for event intake and administrator requests.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/events` | One raw Slack event or `event_callback` envelope; answers `url_verification` |
//! | `POST` | `/events/batch` | JSON array of raw events |
//! | `POST` | `/context` | Build a context bundle for `{ user_id, intent, budget? }` |
//! | `POST` | `/draft` | Context bundle plus a generated reply draft |
//! | `GET`  | `/profiles/{user_id}` | Profile snapshot and persona |
//! | `GET`  | `/stats` | Pipeline counters and store totals |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "malformed_event", "message": "missing channel" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request`, `malformed_event` | 400 |
//! | `not_found`, `insufficient_context` | 404 |
//! | `provider_unavailable` | 503 |
//! | `internal` | 500 |
//!
//! All origins, methods, and headers are permitted.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use rapport_core::error::PipelineError;
use rapport_core::models::{ContextBundle, UserProfile};
use rapport_core::persona::{self, PersonaAssessment};

use crate::generation::Draft;
use crate::pipeline::{IngestOutcome, Pipeline};
use crate::stats::{StatsSnapshot, StoreReport};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/events", post(handle_event))
        .route("/events/batch", post(handle_batch))
        .route("/context", post(handle_context))
        .route("/draft", post(handle_draft))
        .route("/profiles/{user_id}", get(handle_profile))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { pipeline })
}

/// Serve until Ctrl-C, then return so the caller can shut the pipeline
/// down.
pub async fn run_server(pipeline: Arc<Pipeline>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(pipeline);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
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

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let (status, code) = match &err {
            PipelineError::MalformedEvent(_) => (StatusCode::BAD_REQUEST, "malformed_event"),
            PipelineError::InsufficientContext { .. } => {
                (StatusCode::NOT_FOUND, "insufficient_context")
            }
            PipelineError::ProviderUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
            }
            PipelineError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Store(err).into()
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

// ============ POST /events ============

async fn handle_event(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Response, AppError> {
    if raw.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = raw
            .get("challenge")
            .cloned()
            .ok_or_else(|| bad_request("url_verification without challenge"))?;
        return Ok(Json(serde_json::json!({ "challenge": challenge })).into_response());
    }
    let outcome = state.pipeline.ingest(&raw).await?;
    Ok(Json(outcome).into_response())
}

// ============ POST /events/batch ============

#[derive(Debug, Default, Serialize)]
struct BatchResponse {
    accepted: usize,
    duplicates: usize,
    rejected: Vec<Rejected>,
}

#[derive(Debug, Serialize)]
struct Rejected {
    index: usize,
    message: String,
}

async fn handle_batch(
    State(state): State<AppState>,
    Json(events): Json<Vec<Value>>,
) -> Result<Json<BatchResponse>, AppError> {
    let mut resp = BatchResponse::default();
    for (index, raw) in events.iter().enumerate() {
        match state.pipeline.ingest(raw).await {
            Ok(IngestOutcome::Accepted { .. }) => resp.accepted += 1,
            Ok(IngestOutcome::Duplicate { .. }) => resp.duplicates += 1,
            Err(PipelineError::MalformedEvent(message)) => {
                resp.rejected.push(Rejected { index, message })
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Json(resp))
}

// ============ POST /context, POST /draft ============

#[derive(Debug, Deserialize)]
struct ContextRequest {
    user_id: String,
    intent: String,
    #[serde(default)]
    budget: Option<usize>,
}

impl ContextRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.user_id.trim().is_empty() {
            return Err(bad_request("user_id must not be empty"));
        }
        if self.intent.trim().is_empty() {
            return Err(bad_request("intent must not be empty"));
        }
        Ok(())
    }
}

async fn handle_context(
    State(state): State<AppState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<ContextBundle>, AppError> {
    req.validate()?;
    let bundle = state
        .pipeline
        .request_context(&req.user_id, &req.intent, req.budget)
        .await?;
    Ok(Json(bundle))
}

#[derive(Serialize)]
struct DraftResponse {
    draft: Draft,
    context: ContextBundle,
}

async fn handle_draft(
    State(state): State<AppState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<DraftResponse>, AppError> {
    req.validate()?;
    let (context, draft) = state
        .pipeline
        .draft(&req.user_id, &req.intent, req.budget)
        .await?;
    Ok(Json(DraftResponse { draft, context }))
}

// ============ GET /profiles/{user_id} ============

#[derive(Serialize)]
struct ProfileResponse {
    profile: UserProfile,
    persona: PersonaAssessment,
}

async fn handle_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ProfileResponse>, AppError> {
    let profile = state
        .pipeline
        .profile(&user_id)
        .await?
        .ok_or_else(|| not_found(format!("no profile for {}", user_id)))?;
    Ok(Json(ProfileResponse {
        persona: persona::classify(&profile),
        profile: profile.as_ref().clone(),
    }))
}

// ============ GET /stats ============

#[derive(Serialize)]
struct StatsResponse {
    pipeline: StatsSnapshot,
    store: StoreReport,
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    Ok(Json(StatsResponse {
        pipeline: state.pipeline.stats(),
        store: state.pipeline.store_report(10).await?,
    }))
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
