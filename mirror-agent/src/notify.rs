//! Notification delivery.
//!
//! Every notification is logged and broadcast to WebSocket clients. When a
//! command is configured it is also spawned with the title and body as its
//! two arguments, e.g. `notify-send "Backup complete" "Saved ..."`.

use crate::ws::{EventBus, WsEvent};
use mirror_engine::ports::{Notification, NotificationLevel, Notifier};
use std::process::{Command, Stdio};
use tracing::{debug, error, info, warn};

pub struct BroadcastNotifier {
    events: EventBus,
    command: Option<String>,
}

impl BroadcastNotifier {
    pub fn new(events: EventBus, command: Option<String>) -> Self {
        let command = command.filter(|c| !c.trim().is_empty());
        Self { events, command }
    }

    fn spawn_command(&self, program: &str, notification: &Notification) {
        let spawned = Command::new(program)
            .arg(&notification.title)
            .arg(&notification.body)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => {
                // Reap the child without blocking the caller
                std::thread::spawn(move || {
                    if let Err(e) = child.wait() {
                        debug!("Notification command wait failed: {}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to run notification command {}: {}", program, e),
        }
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Info => info!("[notify] {}: {}", notification.title, notification.body),
            NotificationLevel::Warning => warn!("[notify] {}: {}", notification.title, notification.body),
            NotificationLevel::Error => error!("[notify] {}: {}", notification.title, notification.body),
        }

        if let Some(program) = &self.command {
            self.spawn_command(program, &notification);
        }

        self.events.publish(WsEvent::Notification(notification));
    }
}
