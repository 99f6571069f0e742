//! Recent log lines from the in-memory ring.

use super::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use mirror_engine::LogEntry;
use serde::Deserialize;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// GET /logs?limit=N - Most recent entries first
pub async fn recent_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Json<Vec<LogEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(state.logs.capacity());
    Json(state.logs.recent(limit))
}
