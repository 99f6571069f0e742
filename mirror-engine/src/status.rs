//! Published sync status.
//!
//! The orchestrator is the only publisher. Observers (HTTP API, WebSocket
//! clients) hold a watch receiver and always read a complete snapshot.

use crate::naming::MachineId;
use crate::record::SyncStatus;
use crate::trigger::Trigger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// How the most recent finished attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSummary {
    pub status: SyncStatus,
    pub trigger: Trigger,
    pub finished_at: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub machine_id: MachineId,
    pub state: SyncStatus,
    /// Trigger of the attempt in progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    pub since: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<AttemptSummary>,
}

impl StatusSnapshot {
    pub fn idle(machine_id: MachineId, since: DateTime<Utc>) -> Self {
        Self {
            machine_id,
            state: SyncStatus::Idle,
            trigger: None,
            since,
            last_attempt: None,
        }
    }
}

pub struct StatusBroadcaster {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusBroadcaster {
    pub fn new(initial: StatusSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    /// Modify the snapshot in place; succeeds with or without subscribers.
    pub fn update(&self, modify: impl FnOnce(&mut StatusSnapshot)) {
        self.tx.send_modify(modify);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_latest_snapshot() {
        let machine = MachineId::new("home").unwrap();
        let status = StatusBroadcaster::new(StatusSnapshot::idle(machine, Utc::now()));
        let mut rx = status.subscribe();

        status.update(|s| {
            s.state = SyncStatus::Syncing;
            s.trigger = Some(Trigger::Manual);
        });

        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.state, SyncStatus::Syncing);
        assert_eq!(seen.trigger, Some(Trigger::Manual));
        assert_eq!(status.current(), seen);
    }

    #[test]
    fn test_update_without_subscribers() {
        let machine = MachineId::new("home").unwrap();
        let status = StatusBroadcaster::new(StatusSnapshot::idle(machine, Utc::now()));
        status.update(|s| s.state = SyncStatus::Error);
        assert_eq!(status.current().state, SyncStatus::Error);
    }
}
