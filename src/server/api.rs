//! Ollama-compatible HTTP API.
//!
//! - POST /api/generate
//! - POST /api/chat
//! - GET /api/tags
//! - POST /api/show
//! - DELETE /api/delete
//! - GET /

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{CatalogEntry, CatalogError, ModelCatalog, ModelSource};
use crate::format::{self, DecodeError, ModelDescriptor};
use crate::inference::{
    ChatMessage, ChatRequest, EngineError, GenerateRequest, GenerationResult, InferenceEngine,
    ModelInfo, ModelOptions, Role,
};
use crate::server::streaming::ndjson_response;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<dyn InferenceEngine>,
    pub catalog: ModelCatalog,
    /// Resolves request model names to files.
    pub source: Arc<dyn ModelSource>,
    /// Options used when a request loads a model on demand.
    pub load_options: ModelOptions,
    pub start_time: Instant,
}

impl AppState {
    /// State whose models are resolved through `catalog`.
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        catalog: ModelCatalog,
        load_options: ModelOptions,
    ) -> Self {
        Self {
            engine,
            source: Arc::new(catalog.clone()),
            catalog,
            load_options,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/generate", post(generate))
        .route("/api/chat", post(chat))
        .route("/api/tags", get(list_models))
        .route("/api/show", post(show_model))
        .route("/api/delete", delete(delete_model))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub model: String,
    pub created_at: u64,
    pub response: String,
    pub done: bool,
}

impl From<GenerationResult> for GenerateResponse {
    fn from(r: GenerationResult) -> Self {
        Self {
            model: r.model,
            created_at: r.created_at,
            response: r.text,
            done: r.done,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: u64,
    pub message: ChatMessage,
    pub done: bool,
}

impl From<GenerationResult> for ChatResponse {
    fn from(r: GenerationResult) -> Self {
        Self {
            model: r.model,
            created_at: r.created_at,
            message: ChatMessage::new(Role::Assistant, r.text),
            done: r.done,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub models: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    #[serde(alias = "model")]
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ShowResponse {
    pub name: String,
    pub path: String,
    pub descriptor: ModelDescriptor,
    /// Present when the model is resident.
    pub info: Option<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub engine: String,
    pub uptime_secs: u64,
    pub loaded_models: Vec<String>,
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::NotLoaded(_) => StatusCode::NOT_FOUND,
            EngineError::ContextOverflow { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        let status = match &e {
            CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
            CatalogError::InvalidName(_) => StatusCode::BAD_REQUEST,
            CatalogError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<DecodeError> for ApiError {
    fn from(e: DecodeError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// Run blocking engine or filesystem work off the async workers.
async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(Into::into)
}

/// Load `name` on demand: resolve, validate, load with the server's options.
async fn ensure_loaded(state: &Arc<AppState>, name: &str) -> Result<(), ApiError> {
    if state.engine.is_loaded(name) {
        return Ok(());
    }

    let path = state.source.resolve(name)?;
    let engine = state.engine.clone();
    let options = state.load_options.clone();
    let name = name.to_string();

    blocking(move || -> Result<_, ApiError> {
        let descriptor = format::decode(&path)?;
        if !descriptor.valid {
            let reason = descriptor
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("invalid model file {}: {reason}", path.display()),
            ));
        }
        engine.load_model(&name, &path, &options)?;
        Ok(())
    })
    .await
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    info!(%request_id, model = %req.model, stream = req.stream, "Generate request");

    ensure_loaded(&state, &req.model).await?;
    let engine = state.engine.clone();

    if req.stream {
        Ok(ndjson_response(
            move |deliver| engine.generate_stream(&req, deliver),
            GenerateResponse::from,
        ))
    } else {
        let result = blocking(move || engine.generate(&req)).await?;
        Ok(Json(GenerateResponse::from(result)).into_response())
    }
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    info!(
        %request_id,
        model = %req.model,
        messages = req.messages.len(),
        stream = req.stream,
        "Chat request"
    );

    ensure_loaded(&state, &req.model).await?;
    let engine = state.engine.clone();

    if req.stream {
        Ok(ndjson_response(
            move |deliver| engine.chat_stream(&req, deliver),
            ChatResponse::from,
        ))
    } else {
        let result = blocking(move || engine.chat(&req)).await?;
        Ok(Json(ChatResponse::from(result)).into_response())
    }
}

async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelList>, ApiError> {
    let catalog = state.catalog.clone();
    let models = blocking(move || catalog.list()).await?;
    Ok(Json(ModelList { models }))
}

async fn show_model(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NameRequest>,
) -> Result<Json<ShowResponse>, ApiError> {
    let path = state.source.resolve(&req.name)?;
    let engine = state.engine.clone();

    let response = blocking(move || -> Result<_, ApiError> {
        let descriptor = format::decode(&path)?;
        let info = match engine.describe(&req.name) {
            Ok(info) => Some(info),
            Err(e) if e.is_not_loaded() => None,
            Err(e) => return Err(ApiError::from(e)),
        };
        Ok(ShowResponse {
            name: req.name,
            path: path.display().to_string(),
            descriptor,
            info,
        })
    })
    .await?;

    Ok(Json(response))
}

async fn delete_model(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NameRequest>,
) -> Result<StatusCode, ApiError> {
    let engine = state.engine.clone();
    let catalog = state.catalog.clone();

    blocking(move || -> Result<_, ApiError> {
        // Refuse bad names before touching the engine.
        catalog.resolve(&req.name)?;
        match engine.unload_model(&req.name) {
            Ok(()) => {}
            Err(e) if e.is_not_loaded() => {}
            Err(e) => return Err(ApiError::from(e)),
        }
        let path = catalog.remove(&req.name)?;
        info!(model = %req.name, path = %path.display(), "Model deleted");
        Ok(())
    })
    .await?;

    Ok(StatusCode::OK)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine: state.engine.kind().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        loaded_models: state.engine.loaded_models(),
    })
}
