//! WebSocket stream of status changes and notifications.
//!
//! - Agent → client: status snapshots, notifications
//! - Client → agent: sync requests, status requests

pub mod handler;

use crate::api::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use mirror_engine::ports::Notification;
use mirror_engine::StatusSnapshot;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum number of queued messages per subscriber
const BROADCAST_CAPACITY: usize = 256;

/// Pending command replies per client
const REPLY_CAPACITY: usize = 16;

/// Events sent from the agent to connected clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsEvent {
    #[serde(rename = "sync:status")]
    Status(StatusSnapshot),

    #[serde(rename = "notification")]
    Notification(Notification),

    /// Reply to a client command
    #[serde(rename = "command:result")]
    CommandResult { accepted: bool, message: String },
}

/// Commands received from clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsCommand {
    /// Queue a manual sync
    #[serde(rename = "sync:request")]
    RequestSync,

    /// Resend the current status
    #[serde(rename = "sync:status")]
    GetStatus,
}

/// Fan-out of agent events to every connected client
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WsEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Broadcast an event; having no clients is not an error.
    pub fn publish(&self, event: WsEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Broadcast event to {} client(s)", count),
            Err(_) => debug!("No WebSocket clients connected"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Republish every orchestrator status change on the bus.
pub async fn forward_status(mut rx: watch::Receiver<StatusSnapshot>, bus: EventBus, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                bus.publish(WsEvent::Status(snapshot));
            }
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("New WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let rx = state.events.subscribe();
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);

    // Start every client from the current status
    let initial = WsEvent::Status(state.orchestrator.status());
    if send_event(&mut sender, &initial).await.is_err() {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        pump_events(&mut sender, rx, reply_rx).await;
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<WsCommand>(&text) {
                    Ok(command) => {
                        let reply = handler::handle_command(command, &recv_state);
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to parse WebSocket command: {}", e),
                }
            }
        }
    });

    // Wait for either task to finish (connection closed or error)
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}

/// Write this client's command replies and every bus event to the socket
/// until the bus closes or the socket fails.
async fn pump_events<S>(sender: &mut S, mut rx: broadcast::Receiver<WsEvent>, mut replies: mpsc::Receiver<WsEvent>)
where
    S: SinkExt<Message> + Unpin,
{
    let mut replies_open = true;

    loop {
        let event = tokio::select! {
            biased;
            reply = replies.recv(), if replies_open => match reply {
                Some(reply) => reply,
                None => {
                    replies_open = false;
                    continue;
                }
            },
            event = rx.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagging, skipped {} event(s)", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if send_event(sender, &event).await.is_err() {
            break;
        }
    }
}

async fn send_event<S>(sender: &mut S, event: &WsEvent) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
