//! Sync status and control endpoints.

use super::{ApiError, AppState};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use mirror_engine::trigger::FeedError;
use mirror_engine::{BackupSnapshot, LifecycleEvent, StatusSnapshot, SyncRecord};
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: StatusSnapshot,
    pub record: Option<SyncRecord>,
}

/// GET /status - Current state machine snapshot and the stored record
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.orchestrator.status();
    let record = state.orchestrator.record().await?;
    Ok(Json(StatusResponse { status, record }))
}

/// POST /sync - Queue a manual sync
pub async fn request_sync(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    info!("Manual sync requested");

    match state.feed.try_emit(LifecycleEvent::ManualRequest) {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true })))),
        Err(FeedError::Full) => Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "queueFull",
            "Too many pending sync requests",
        )),
        Err(FeedError::Closed) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "shuttingDown",
            "Agent is shutting down",
        )),
    }
}

/// GET /snapshots - This machine's snapshots, newest first
pub async fn snapshots(State(state): State<AppState>) -> Result<Json<Vec<BackupSnapshot>>, ApiError> {
    Ok(Json(state.orchestrator.snapshots().await?))
}

/// GET /snapshots/latest - This machine's most recent snapshot
pub async fn latest_snapshot(State(state): State<AppState>) -> Result<Json<BackupSnapshot>, ApiError> {
    Ok(Json(state.orchestrator.latest_snapshot().await?))
}
