//! HTTP API module for the mirror agent.

pub mod health;
pub mod logs;
pub mod sync;

use crate::ws::EventBus;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mirror_engine::{LogBuffer, SyncError, SyncOrchestrator, TriggerFeed};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub feed: TriggerFeed,
    pub logs: LogBuffer,
    pub events: EventBus,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, feed: TriggerFeed, logs: LogBuffer, events: EventBus) -> Self {
        Self {
            orchestrator,
            feed,
            logs,
            events,
            started_at: Instant::now(),
        }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Sync endpoints
        .route("/status", get(sync::status))
        .route("/sync", post(sync::request_sync))
        .route("/snapshots", get(sync::snapshots))
        .route("/snapshots/latest", get(sync::latest_snapshot))
        .route("/logs", get(logs::recent_logs))
        // WebSocket endpoint
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response carrying the engine's error code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::NoBackupFound(_) => StatusCode::NOT_FOUND,
            SyncError::BackendNotAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "Request failed: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message, "code": self.code }))).into_response()
    }
}
