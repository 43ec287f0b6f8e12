//! HTTP front end.
//!
//! A single-page upload form plus a JSON API over [`Pipeline::answer`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Upload page: spreadsheet file, question, answer area |
//! | `POST` | `/answer` | Answer a question about an uploaded spreadsheet |
//! | `GET`  | `/health` | Health check (returns version and models) |
//!
//! # Request
//!
//! ```json
//! { "filename": "survey.xlsx", "content_base64": "UEsDB...", "question": "...", "k": 16 }
//! ```
//!
//! `k` is optional and defaults to `retrieval.k`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unsupported_format", "stage": "loading", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unsupported_format` (422), `empty_index` (422),
//! `embedding_error` (502), `generation_error` (502), `timeout` (504),
//! `config_error` (500).
//!
//! A refusal is a successful response with `"refused": true`, never an error.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ErrorKind, PipelineFailure};
use crate::loader::DocumentSource;
use crate::models::Chunk;
use crate::pipeline::Pipeline;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Build the application router around an existing pipeline.
///
/// `max_upload_bytes` bounds the decoded spreadsheet size; the JSON body
/// limit is derived from it to leave room for base64 overhead.
pub fn router(pipeline: Pipeline, max_upload_bytes: usize) -> Router {
    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = max_upload_bytes / 3 * 4 + 64 * 1024;

    Router::new()
        .route("/", get(handle_index))
        .route("/answer", post(handle_answer))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let app = router(pipeline, config.server.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"embedding_error"`).
    code: String,
    /// Pipeline stage that failed; absent for request validation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    stage: Option<String>,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                stage: self.stage,
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
        stage: None,
        message: message.into(),
    }
}

impl From<PipelineFailure> for AppError {
    fn from(failure: PipelineFailure) -> Self {
        let kind = failure.kind();
        let status = match kind {
            ErrorKind::UnsupportedFormat | ErrorKind::EmptyIndex => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::Embedding | ErrorKind::Generation => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Config => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: kind.code().to_string(),
            stage: Some(failure.stage.to_string()),
            message: failure.error.to_string(),
        }
    }
}

// ============ GET / ============

const INDEX_HTML: &str = include_str!("index.html");

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

// ============ POST /answer ============

#[derive(Deserialize)]
struct AnswerRequest {
    filename: String,
    content_base64: String,
    question: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct AnswerResponse {
    text: String,
    /// True when the answer is the fixed refusal text.
    refused: bool,
    evidence: Vec<Chunk>,
}

async fn handle_answer(
    State(state): State<AppState>,
    payload: Result<Json<AnswerRequest>, JsonRejection>,
) -> Result<Json<AnswerResponse>, AppError> {
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;

    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    if req.filename.trim().is_empty() {
        return Err(bad_request("filename must not be empty"));
    }

    // Accept both raw base64 and `data:...;base64,` URLs.
    let encoded = match req.content_base64.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => req.content_base64.as_str(),
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?;

    info!(filename = %req.filename, bytes = bytes.len(), "answer request");
    let source = DocumentSource::from_bytes(req.filename, bytes);

    match state.pipeline.answer(&source, &req.question, req.k).await {
        Ok(answer) => Ok(Json(AnswerResponse {
            refused: answer.is_refusal(),
            text: answer.text,
            evidence: answer.evidence,
        })),
        Err(failure) => {
            warn!(stage = %failure.stage, code = failure.kind().code(), "{}", failure);
            Err(failure.into())
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
    embedding_model: String,
    llm_model: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        embedding_model: state.pipeline.embedder().model_name().to_string(),
        llm_model: state.pipeline.llm().model_name().to_string(),
    })
}
