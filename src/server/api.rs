//! JSON API and routing for the completion UI:
//! - GET /
//! - POST /api/complete
//! - GET /api/examples
//! - GET /api/model
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Number;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::pipeline::{
    CompletionError, CompletionPipeline, ErrorKind, GenerationParameters, WordCounts,
};
use crate::server::page;

/// Application state shared across handlers.
pub struct AppState {
    pub pipeline: Arc<CompletionPipeline>,
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(pipeline: Arc<CompletionPipeline>, config: Arc<Config>, metrics: Metrics) -> Self {
        Self {
            pipeline,
            config,
            metrics,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(page::index))
        .route("/api/complete", post(complete))
        .route("/api/examples", get(examples))
        .route("/api/model", get(model_info))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Completion request. Omitted knobs take the configured defaults.
///
/// Knobs accept any JSON number and are clamped later, so `100.0` or an
/// integer wider than 64 bits is still a valid length.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<Number>,
    #[serde(default)]
    pub max_length: Option<Number>,
}

fn number_as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

/// Saturating conversion; fractional lengths truncate.
fn number_as_i64(n: &Number) -> i64 {
    if let Some(v) = n.as_i64() {
        v
    } else if n.as_u64().is_some() {
        i64::MAX
    } else {
        // `as` saturates at the bounds and maps NaN to 0.
        n.as_f64().map_or(0, |f| f as i64)
    }
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub id: String,
    pub completion: String,
    pub full_text: String,
    pub parameters: GenerationParameters,
    pub stats: CompletionStats,
}

#[derive(Debug, Serialize)]
pub struct CompletionStats {
    /// Prompt length in tokens.
    pub input_length: usize,
    /// Generated length in tokens.
    pub output_length: usize,
    pub words: WordCounts,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// `empty_prompt`, `model_load`, `generation` or `invalid_request`.
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "no_hints")]
    pub hints: &'static [&'static str],
}

#[derive(Debug, Serialize)]
pub struct ExamplesResponse {
    pub prompts: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub revision: String,
    pub loaded: bool,
    pub device: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub engine_loaded: bool,
    pub load_attempts: usize,
}

fn no_hints(hints: &&'static [&'static str]) -> bool {
    hints.is_empty()
}

/// A failed request rendered as JSON.
pub enum ApiError {
    Completion(CompletionError),
    /// The body was not a JSON object of the expected shape.
    InvalidBody(JsonRejection),
}

impl From<CompletionError> for ApiError {
    fn from(e: CompletionError) -> Self {
        ApiError::Completion(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::InvalidBody(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Completion(e) => {
                let kind = e.kind();
                let status = match kind {
                    ErrorKind::EmptyPrompt => StatusCode::UNPROCESSABLE_ENTITY,
                    ErrorKind::ModelLoad => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::Generation => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let detail = ErrorDetail {
                    kind: kind.as_str(),
                    message: e.to_string(),
                    hints: e.hints(),
                };
                (status, detail)
            }
            ApiError::InvalidBody(rejection) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail {
                    kind: "invalid_request",
                    message: rejection.body_text(),
                    hints: &[],
                },
            ),
        };
        (status, Json(ErrorBody { error: detail })).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn complete(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let Json(req) = payload?;
    let defaults = &state.config.generation;
    let params = GenerationParameters::new(
        req.temperature
            .as_ref()
            .map_or(defaults.temperature, number_as_f64),
        req.max_length
            .as_ref()
            .map_or(defaults.max_length, number_as_i64),
    );

    let start = Instant::now();
    let result = state.pipeline.complete(&req.prompt, params).await;
    state.metrics.observe(&result, start.elapsed());
    let completion = result?;

    Ok(Json(CompleteResponse {
        id: format!("cmpl-{}", completion.request_id()),
        completion: completion.generated_text().to_string(),
        full_text: completion.full_text(),
        parameters: completion.parameters(),
        stats: CompletionStats {
            input_length: completion.input_length(),
            output_length: completion.output_length(),
            words: completion.word_counts(),
        },
    }))
}

async fn examples(State(state): State<Arc<AppState>>) -> Json<ExamplesResponse> {
    Json(ExamplesResponse {
        prompts: state.config.ui.example_prompts.clone(),
    })
}

async fn model_info(State(state): State<Arc<AppState>>) -> Json<ModelInfo> {
    let loader = state.pipeline.loader();
    let engine = loader.loaded();
    Json(ModelInfo {
        model_id: loader.spec().id.clone(),
        revision: loader.spec().revision.clone(),
        loaded: engine.is_some(),
        device: engine.map(|e| e.device().to_string()),
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let loader = state.pipeline.loader();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        engine_loaded: loader.loaded().is_some(),
        load_attempts: loader.load_attempts(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok((content_type, body)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
