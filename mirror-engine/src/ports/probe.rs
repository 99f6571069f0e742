//! Host probes: the source application's process and the clock.

use chrono::{DateTime, Utc};

/// Reports whether the application owning the source data is running.
///
/// Syncing while it runs could copy a half-written database.
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self) -> bool;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
