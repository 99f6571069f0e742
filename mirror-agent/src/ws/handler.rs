//! WebSocket command handlers.

use super::{WsCommand, WsEvent};
use crate::api::AppState;
use mirror_engine::LifecycleEvent;
use tracing::{info, warn};

/// Handle a command from a client and build the reply event
pub fn handle_command(command: WsCommand, state: &AppState) -> WsEvent {
    match command {
        WsCommand::RequestSync => handle_sync_request(state),
        WsCommand::GetStatus => WsEvent::Status(state.orchestrator.status()),
    }
}

fn handle_sync_request(state: &AppState) -> WsEvent {
    info!("Sync requested over WebSocket");

    match state.feed.try_emit(LifecycleEvent::ManualRequest) {
        Ok(()) => WsEvent::CommandResult {
            accepted: true,
            message: "Sync queued".to_string(),
        },
        Err(e) => {
            warn!("Sync request rejected: {}", e);
            WsEvent::CommandResult {
                accepted: false,
                message: e.to_string(),
            }
        }
    }
}
