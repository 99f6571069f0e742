//! Persisted per-machine sync history.

use crate::naming::MachineId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Phase of the sync state machine, also stored as the last recorded outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }

    /// Edges of `Idle -> Syncing -> {Success, Error} -> Idle`.
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (SyncStatus::Idle, SyncStatus::Syncing)
                | (SyncStatus::Syncing, SyncStatus::Success)
                | (SyncStatus::Syncing, SyncStatus::Error)
                | (SyncStatus::Success, SyncStatus::Idle)
                | (SyncStatus::Error, SyncStatus::Idle)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub machine_id: MachineId,
    /// Time of the last successful sync
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_status: SyncStatus,
    pub last_backup_location: Option<String>,
    pub total_syncs: u64,
    pub last_error: Option<String>,
}

impl SyncRecord {
    pub fn new(machine_id: MachineId) -> Self {
        Self {
            machine_id,
            last_sync_time: None,
            last_sync_status: SyncStatus::Idle,
            last_backup_location: None,
            total_syncs: 0,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>, location: impl Into<String>) {
        self.last_sync_time = Some(at);
        self.last_sync_status = SyncStatus::Success;
        self.last_backup_location = Some(location.into());
        self.total_syncs = self.total_syncs.saturating_add(1);
        self.last_error = None;
    }

    /// Failures keep the last successful time, location and count.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_sync_status = SyncStatus::Error;
        self.last_error = Some(error.into());
    }
}
