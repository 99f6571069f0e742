//! Notification port.
//!
//! Delivery is fire-and-forget: the engine never waits for the user and a
//! failed delivery must not affect the sync outcome, so `notify` returns
//! nothing. Adapters log their own delivery failures.

use crate::error::{Severity, SyncError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub level: NotificationLevel,
    /// Error code when the notification reports a [`SyncError`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            level: NotificationLevel::Info,
            code: None,
        }
    }

    pub fn with_level(mut self, level: NotificationLevel) -> Self {
        self.level = level;
        self
    }
}

impl From<&SyncError> for Notification {
    fn from(err: &SyncError) -> Self {
        let level = match err.severity() {
            Severity::Warning => NotificationLevel::Warning,
            Severity::Error => NotificationLevel::Error,
        };

        Self {
            title: err.title().to_string(),
            body: err.to_string(),
            level,
            code: Some(err.code().to_string()),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}
