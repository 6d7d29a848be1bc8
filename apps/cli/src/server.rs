//! Admin HTTP surface: catalog and settings edits, collector config, and
//! stage runs (streamed over SSE or fire-and-forget).

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use mcpinsider_core::admin::CatalogAdmin;
use mcpinsider_core::gateway::{self, Stage, StageRunner};
use mcpinsider_shared::{CollectorConfig, ErrorClass, InsiderError, PipelineSettings};

/// Shared handler state.
#[derive(Clone)]
pub(crate) struct AppState {
    pub admin: Arc<CatalogAdmin>,
    pub stages: Arc<dyn StageRunner>,
}

pub(crate) fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/data", get(handle_catalog))
        .route("/api/data/{url}", post(handle_update_entry).delete(handle_delete_entry))
        .route("/api/settings", get(handle_get_settings).post(handle_put_settings))
        .route("/api/config", get(handle_get_config).post(handle_put_config))
        .route("/api/stages/{stage}/stream", get(handle_stage_stream))
        .route("/api/{stage}", post(handle_stage_detached))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub(crate) async fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "admin server listening");
    println!("Admin server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down admin server");
        })
        .await
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// JSON error body: `{"error": {"code", "message"}}`.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
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
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<InsiderError> for AppError {
    fn from(err: InsiderError) -> Self {
        match err.class() {
            ErrorClass::ValidationFailure => bad_request(err.to_string()),
            ErrorClass::NotFound => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: err.to_string(),
            },
            class => {
                warn!(error = %err, %class, "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: err.to_string(),
                }
            }
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {e}")))
}

fn parse_stage(name: &str) -> Result<Stage, AppError> {
    name.parse().map_err(AppError::from)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_catalog(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.admin.catalog().await?))
}

async fn handle_update_entry(
    State(state): State<AppState>,
    Path(url): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let fields: serde_json::Value = parse_body(&body)?;
    let entry = state.admin.update_entry(&url, fields).await?;
    Ok(Json(json!({ "success": true, "entry": entry })))
}

async fn handle_delete_entry(
    State(state): State<AppState>,
    Path(url): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.admin.delete_entry(&url).await?;
    Ok(Json(json!({ "success": true })))
}

async fn handle_get_settings(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.admin.settings().await?))
}

async fn handle_put_settings(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let settings: PipelineSettings = parse_body(&body)?;
    Ok(Json(state.admin.replace_settings(settings).await?))
}

async fn handle_get_config(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.admin.collector_config().await?))
}

async fn handle_put_config(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let collector: CollectorConfig = parse_body(&body)?;
    Ok(Json(state.admin.replace_collector_config(collector).await?))
}

/// Relay a stage's events as SSE. A disconnecting client drops the stream,
/// which kills the subprocess.
async fn handle_stage_stream(
    State(state): State<AppState>,
    Path(stage): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let stage = parse_stage(&stage)?;
    let session = state.stages.open(stage).await?;
    info!(%stage, session_id = %session.session_id(), "streaming stage over SSE");

    let events = session
        .into_stream()
        .map(|event| Event::default().event(event.name()).json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn handle_stage_detached(
    State(state): State<AppState>,
    Path(stage): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let stage = parse_stage(&stage)?;
    let accepted = gateway::spawn_detached(state.stages.as_ref(), stage).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
