//! Lifecycle trigger source.
//!
//! Everything that may start a sync is turned into a [`LifecycleEvent`] and
//! pushed into one bounded FIFO feed. A single [`TriggerLoop`] drains the
//! feed and handles each event to completion before taking the next one.
//!
//! Producers:
//! - the source process watcher (launch and terminate transitions)
//! - the host wake detector
//! - manual requests from the status API
//! - a startup event from the daemon

use crate::error::SyncError;
use crate::lock::{LockCoordinator, LockMarker};
use crate::naming::MachineId;
use crate::orchestrator::{AttemptOutcome, SyncOrchestrator};
use crate::ports::{Clock, Notification, Notifier, ProcessProbe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const FEED_CAPACITY: usize = 32;

/// Why a sync attempt was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Startup,
    SourceTerminated,
    HostWake,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Startup => "startup",
            Trigger::SourceTerminated => "source_terminated",
            Trigger::HostWake => "host_wake",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ManualRequest,
    Startup,
    SourceLaunched,
    SourceTerminated,
    HostWake,
}

impl LifecycleEvent {
    /// The sync trigger this event maps to; `SourceLaunched` starts none.
    pub fn trigger(self) -> Option<Trigger> {
        match self {
            LifecycleEvent::ManualRequest => Some(Trigger::Manual),
            LifecycleEvent::Startup => Some(Trigger::Startup),
            LifecycleEvent::SourceTerminated => Some(Trigger::SourceTerminated),
            LifecycleEvent::HostWake => Some(Trigger::HostWake),
            LifecycleEvent::SourceLaunched => None,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedError {
    #[error("trigger queue is full")]
    Full,

    #[error("trigger loop has stopped")]
    Closed,
}

/// Sending half of the event feed.
#[derive(Debug, Clone)]
pub struct TriggerFeed {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl TriggerFeed {
    /// Queue an event without waiting; used by request handlers.
    pub fn try_emit(&self, event: LifecycleEvent) -> Result<(), FeedError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FeedError::Full,
            mpsc::error::TrySendError::Closed(_) => FeedError::Closed,
        })
    }

    /// Queue an event, waiting for room. Watchers use this so transitions
    /// are never dropped.
    pub async fn emit(&self, event: LifecycleEvent) -> Result<(), FeedError> {
        self.tx.send(event).await.map_err(|_| FeedError::Closed)
    }
}

pub fn channel() -> (TriggerFeed, mpsc::Receiver<LifecycleEvent>) {
    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    (TriggerFeed { tx }, rx)
}

/// Marker bracketing the window in which the source application is open.
pub struct SessionGuard {
    locks: LockCoordinator,
    machine: MachineId,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    marker: Option<LockMarker>,
}

impl SessionGuard {
    pub fn new(
        locks: LockCoordinator,
        machine: MachineId,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            locks,
            machine,
            notifier,
            clock,
            marker: None,
        }
    }

    pub fn marker(&self) -> Option<&LockMarker> {
        self.marker.as_ref()
    }

    /// Place the session marker. Live markers of other machines are
    /// reported as a conflict; the session is opened regardless.
    pub async fn open(&mut self) {
        if self.marker.is_some() {
            debug!("Session marker already placed");
            return;
        }

        let locks = self.locks.clone();
        let machine = self.machine.clone();
        let now = self.clock.now();
        let placed = tokio::task::spawn_blocking(move || locks.place(&machine, now)).await;

        match placed {
            Ok(Ok(placed)) => {
                for other in &placed.conflicts {
                    let err = SyncError::ConflictDetected(format!(
                        "backup data is also in use on {} ({})",
                        other.machine_id,
                        other.name()
                    ));
                    warn!(code = err.code(), "{}", err);
                    self.notifier.notify(Notification::from(&err));
                }
                self.marker = Some(placed.marker);
            }
            Ok(Err(e)) => warn!(code = e.code(), "Could not place session marker: {}", e),
            Err(e) => warn!("Session marker task failed: {}", e),
        }
    }

    /// Remove the session marker if one is held.
    pub async fn close(&mut self) {
        let Some(marker) = self.marker.take() else {
            return;
        };

        let locks = self.locks.clone();
        let released = tokio::task::spawn_blocking(move || locks.release(&marker)).await;
        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(code = e.code(), "Could not remove session marker: {}", e),
            Err(e) => warn!("Session marker task failed: {}", e),
        }
    }
}

/// Single consumer of the event feed.
pub struct TriggerLoop {
    orchestrator: Arc<SyncOrchestrator>,
    session: SessionGuard,
    rx: mpsc::Receiver<LifecycleEvent>,
}

impl TriggerLoop {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, rx: mpsc::Receiver<LifecycleEvent>) -> Self {
        let session = SessionGuard::new(
            orchestrator.lock_coordinator().clone(),
            orchestrator.machine().clone(),
            orchestrator.notifier().clone(),
            orchestrator.clock().clone(),
        );

        Self {
            orchestrator,
            session,
            rx,
        }
    }

    pub fn session(&self) -> &SessionGuard {
        &self.session
    }

    pub async fn handle(&mut self, event: LifecycleEvent) -> Option<AttemptOutcome> {
        debug!(?event, "Handling lifecycle event");

        match event {
            LifecycleEvent::SourceLaunched => {
                info!("Source application started");
                self.session.open().await;
                None
            }
            LifecycleEvent::SourceTerminated => {
                info!("Source application exited");
                self.session.close().await;
                Some(self.orchestrator.attempt_sync(Trigger::SourceTerminated).await)
            }
            other => match other.trigger() {
                Some(trigger) => Some(self.orchestrator.attempt_sync(trigger).await),
                None => None,
            },
        }
    }

    /// Drain the feed until it closes or `cancel` fires. An attempt in
    /// progress always runs to completion.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Trigger loop started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }

        self.session.close().await;
        info!("Trigger loop stopped");
    }
}

/// Map two consecutive probe readings to an event.
///
/// An application already running at the first reading opens a session.
pub fn process_transition(previous: Option<bool>, running: bool) -> Option<LifecycleEvent> {
    match (previous, running) {
        (None, true) | (Some(false), true) => Some(LifecycleEvent::SourceLaunched),
        (Some(true), false) => Some(LifecycleEvent::SourceTerminated),
        _ => None,
    }
}

/// Poll the process probe and emit launch and terminate transitions.
pub async fn watch_source_process(
    probe: Arc<dyn ProcessProbe>,
    feed: TriggerFeed,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let probe = probe.clone();
        let running = match tokio::task::spawn_blocking(move || probe.is_running()).await {
            Ok(running) => running,
            Err(e) => {
                warn!("Process probe task failed: {}", e);
                continue;
            }
        };

        if let Some(event) = process_transition(previous, running) {
            if feed.emit(event).await.is_err() {
                break;
            }
        }
        previous = Some(running);
    }

    debug!("Process watcher stopped");
}

/// True when the wall clock advanced by more than `threshold` beyond the
/// monotonic clock, which does not count time spent suspended.
pub fn detect_wake(wall_elapsed: chrono::Duration, mono_elapsed: Duration, threshold: Duration) -> bool {
    let Ok(wall) = wall_elapsed.to_std() else {
        return false;
    };
    wall.saturating_sub(mono_elapsed) > threshold
}

/// Emit `HostWake` after the host resumes from sleep.
pub async fn watch_host_wake(
    clock: Arc<dyn Clock>,
    feed: TriggerFeed,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut last_wall: DateTime<Utc> = clock.now();
    let mut last_mono = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let wall = clock.now();
        let mono = Instant::now();
        if detect_wake(wall - last_wall, mono - last_mono, threshold) {
            info!("Host resumed from sleep");
            if feed.emit(LifecycleEvent::HostWake).await.is_err() {
                break;
            }
        }
        last_wall = wall;
        last_mono = mono;
    }

    debug!("Wake detector stopped");
}
