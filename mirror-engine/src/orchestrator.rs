//! Sync orchestrator.
//!
//! Runs one sync attempt at a time through the state machine
//! `Idle -> Syncing -> {Success, Error} -> Idle`. Each attempt checks its
//! preconditions in a fixed order, copies the source tree into a fresh
//! snapshot, records the outcome and prunes old snapshots. Every phase
//! change is published through the [`StatusBroadcaster`] from here only.

use crate::error::{FilesystemError, Result, SyncError};
use crate::fs::{CopyStats, FileSystemGateway};
use crate::lock::{LockAcquisition, LockCoordinator, LockMarker, LockProbe, DEFAULT_STALE_AFTER_HOURS};
use crate::naming::{self, MachineId};
use crate::ports::{Clock, Notification, Notifier, ProcessProbe, StateStore};
use crate::record::{SyncRecord, SyncStatus};
use crate::retention::{BackupSnapshot, PruneReport, RetentionManager, DEFAULT_RETENTION};
use crate::status::{AttemptSummary, StatusBroadcaster, StatusSnapshot};
use crate::trigger::Trigger;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Upper bound on stale markers cleared within one attempt.
const MAX_STALE_RECOVERIES: usize = 8;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Directory tree owned by the source application
    pub source: PathBuf,
    /// Shared root holding snapshots and lock markers
    pub shared_root: PathBuf,
    pub stale_after: Duration,
    /// Snapshots kept per machine
    pub retention: usize,
}

impl EngineSettings {
    pub fn new(source: impl Into<PathBuf>, shared_root: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            shared_root: shared_root.into(),
            stale_after: Duration::hours(DEFAULT_STALE_AFTER_HOURS),
            retention: DEFAULT_RETENTION,
        }
    }
}

/// External collaborators of the orchestrator.
#[derive(Clone)]
pub struct SyncDeps {
    pub fs: Arc<dyn FileSystemGateway>,
    pub store: Arc<dyn StateStore>,
    pub notifier: Arc<dyn Notifier>,
    pub probe: Arc<dyn ProcessProbe>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub trigger: Trigger,
    pub snapshot: BackupSnapshot,
    pub copy: CopyStats,
    pub record: SyncRecord,
    pub pruned: PruneReport,
    pub stale_markers_removed: Vec<LockMarker>,
    /// Non-fatal problems: marker release and pruning failures
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    /// Another attempt was already running
    Skipped,
    Succeeded(Box<SyncReport>),
    Failed(SyncError),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded(_))
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            AttemptOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

pub struct SyncOrchestrator {
    machine: MachineId,
    settings: EngineSettings,
    fs: Arc<dyn FileSystemGateway>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    probe: Arc<dyn ProcessProbe>,
    clock: Arc<dyn Clock>,
    locks: LockCoordinator,
    retention: RetentionManager,
    phase: Mutex<SyncStatus>,
    status: StatusBroadcaster,
}

/// Returns the orchestrator to `Idle` when an attempt ends, including when
/// the attempt future is dropped.
struct AttemptGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.finish_attempt();
    }
}

impl SyncOrchestrator {
    pub fn new(machine: MachineId, settings: EngineSettings, deps: SyncDeps) -> Self {
        let locks = LockCoordinator::new(deps.fs.clone(), &settings.shared_root, settings.stale_after);
        let retention = RetentionManager::new(deps.fs.clone(), &settings.shared_root);
        let status = StatusBroadcaster::new(StatusSnapshot::idle(machine.clone(), deps.clock.now()));

        Self {
            machine,
            settings,
            fs: deps.fs,
            store: deps.store,
            notifier: deps.notifier,
            probe: deps.probe,
            clock: deps.clock,
            locks,
            retention,
            phase: Mutex::new(SyncStatus::Idle),
            status,
        }
    }

    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn lock_coordinator(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn phase(&self) -> SyncStatus {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Stored record of this machine, if it ever synced.
    pub async fn record(&self) -> Result<Option<SyncRecord>> {
        let store = self.store.clone();
        let machine = self.machine.clone();
        run_blocking(&self.settings.shared_root, move || {
            store.load(&machine).map_err(SyncError::state_store)
        })
        .await
    }

    /// This machine's snapshots, newest first.
    pub async fn snapshots(&self) -> Result<Vec<BackupSnapshot>> {
        let retention = self.retention.clone();
        let machine = self.machine.clone();
        run_blocking(&self.settings.shared_root, move || retention.list_snapshots(&machine)).await
    }

    pub async fn latest_snapshot(&self) -> Result<BackupSnapshot> {
        let retention = self.retention.clone();
        let machine = self.machine.clone();
        run_blocking(&self.settings.shared_root, move || retention.latest_snapshot(&machine)).await
    }

    /// Run one sync attempt.
    ///
    /// Returns `Skipped` immediately if an attempt is already in progress.
    /// Failures are logged, notified and published; they are also returned
    /// so callers can report them.
    pub async fn attempt_sync(&self, trigger: Trigger) -> AttemptOutcome {
        let Some(_guard) = self.begin_attempt(trigger) else {
            info!(%trigger, "Sync already in progress, ignoring trigger");
            return AttemptOutcome::Skipped;
        };

        let started_at = self.clock.now();
        info!(machine = %self.machine, %trigger, "Starting sync");

        match self.run_attempt(trigger, started_at).await {
            Ok(report) => {
                info!(
                    machine = %self.machine,
                    snapshot = %report.snapshot.name,
                    files = report.copy.files,
                    bytes = report.copy.bytes,
                    pruned = report.pruned.removed.len(),
                    "Sync completed"
                );
                self.notifier.notify(Notification::new(
                    "Backup complete",
                    format!("Saved {} ({} files)", report.snapshot.name, report.copy.files),
                ));
                self.complete_attempt(
                    SyncStatus::Success,
                    trigger,
                    format!("Saved {}", report.snapshot.name),
                    None,
                );
                AttemptOutcome::Succeeded(Box::new(report))
            }
            Err(err) => {
                error!(machine = %self.machine, %trigger, code = err.code(), "Sync failed: {}", err);
                self.notifier.notify(Notification::from(&err));
                self.complete_attempt(
                    SyncStatus::Error,
                    trigger,
                    err.to_string(),
                    Some(err.code().to_string()),
                );
                AttemptOutcome::Failed(err)
            }
        }
    }

    async fn run_attempt(&self, trigger: Trigger, started_at: DateTime<Utc>) -> Result<SyncReport> {
        let mut stale_markers_removed = Vec::new();

        if self.probe.is_running() {
            return Err(SyncError::SourceApplicationRunning);
        }
        self.check_lock(started_at, &mut stale_markers_removed).await?;
        self.check_backend().await?;
        self.check_source().await?;
        self.check_snapshot_slot(started_at).await?;

        let marker = self.acquire_lock(started_at, &mut stale_markers_removed).await?;
        let body = self.copy_and_record(started_at).await;

        let mut warnings = Vec::new();
        if let Err(e) = self.release_lock(marker).await {
            warnings.push(format!("Lock file not removed: {e}"));
        }

        let (snapshot, copy, record) = match body {
            Ok(done) => done,
            Err(err) => {
                self.record_failure(&err).await;
                return Err(err);
            }
        };

        let pruned = self.prune(&mut warnings).await;

        Ok(SyncReport {
            trigger,
            snapshot,
            copy,
            record,
            pruned,
            stale_markers_removed,
            warnings,
            started_at,
            finished_at: self.clock.now(),
        })
    }

    /// Fails on a live marker; stale markers are removed and reported.
    async fn check_lock(&self, now: DateTime<Utc>, removed: &mut Vec<LockMarker>) -> Result<()> {
        for _ in 0..MAX_STALE_RECOVERIES {
            let locks = self.locks.clone();
            let probe = run_blocking(&self.settings.shared_root, move || locks.probe(now)).await?;

            match probe {
                LockProbe::Free => return Ok(()),
                LockProbe::Busy(marker) => return Err(SyncError::LockFileExists(marker)),
                LockProbe::Stale(marker) => {
                    self.recover_stale(marker.clone(), now).await?;
                    removed.push(marker);
                }
            }
        }

        self.stale_limit_reached(now).await
    }

    async fn acquire_lock(&self, now: DateTime<Utc>, removed: &mut Vec<LockMarker>) -> Result<LockMarker> {
        for _ in 0..MAX_STALE_RECOVERIES {
            let locks = self.locks.clone();
            let machine = self.machine.clone();
            let acquired =
                run_blocking(&self.settings.shared_root, move || locks.acquire(&machine, now)).await?;

            match acquired {
                LockAcquisition::Acquired(marker) => return Ok(marker),
                LockAcquisition::Busy(marker) => return Err(SyncError::LockFileExists(marker)),
                LockAcquisition::Stale(marker) => {
                    self.recover_stale(marker.clone(), now).await?;
                    removed.push(marker);
                }
            }
        }

        self.stale_limit_reached(now).await
    }

    async fn recover_stale(&self, marker: LockMarker, now: DateTime<Utc>) -> Result<()> {
        let locks = self.locks.clone();
        let forced = marker.clone();
        run_blocking(&self.settings.shared_root, move || locks.force_release(&forced, now)).await?;

        let anomaly = SyncError::StaleLockFile(marker);
        warn!(code = anomaly.code(), "{}", anomaly);
        self.notifier.notify(Notification::from(&anomaly));
        Ok(())
    }

    /// Stale markers keep reappearing; report whatever blocks the root now.
    /// Never returns `Ok`.
    async fn stale_limit_reached<T>(&self, now: DateTime<Utc>) -> Result<T> {
        let locks = self.locks.clone();
        let markers = run_blocking(&self.settings.shared_root, move || locks.markers()).await?;
        match markers.into_iter().last() {
            Some(marker) if marker.is_stale(now, self.settings.stale_after) => Err(SyncError::StaleLockFile(marker)),
            Some(marker) => Err(SyncError::LockFileExists(marker)),
            None => Err(SyncError::ConflictDetected(
                "lock files changed repeatedly during the attempt".to_string(),
            )),
        }
    }

    async fn check_backend(&self) -> Result<()> {
        let fs = self.fs.clone();
        let root = self.settings.shared_root.clone();
        let reachable = run_blocking(&self.settings.shared_root, move || {
            Ok(fs.attributes(&root).map(|attrs| attrs.is_dir).unwrap_or(false))
        })
        .await?;

        if reachable {
            Ok(())
        } else {
            Err(SyncError::BackendNotAvailable(self.settings.shared_root.clone()))
        }
    }

    async fn check_source(&self) -> Result<()> {
        let fs = self.fs.clone();
        let source = self.settings.source.clone();
        run_blocking(&self.settings.source, move || match fs.attributes(&source) {
            Ok(attrs) if attrs.is_dir => Ok(()),
            Ok(_) => Err(SyncError::InvalidDirectoryStructure(format!(
                "{} is not a directory",
                source.display()
            ))),
            Err(e) if e.is_not_found() => Err(SyncError::SourceDirectoryNotFound(source)),
            Err(e) => Err(e.into()),
        })
        .await
    }

    /// Snapshots are never rewritten: a second attempt within the same
    /// minute is refused instead of replacing the earlier one.
    async fn check_snapshot_slot(&self, now: DateTime<Utc>) -> Result<()> {
        let fs = self.fs.clone();
        let path = self.settings.shared_root.join(naming::snapshot_name(&self.machine, now));
        run_blocking(&self.settings.shared_root, move || snapshot_slot_free(fs.as_ref(), &path)).await
    }

    async fn copy_and_record(&self, now: DateTime<Utc>) -> Result<(BackupSnapshot, CopyStats, SyncRecord)> {
        let fs = self.fs.clone();
        let store = self.store.clone();
        let clock = self.clock.clone();
        let machine = self.machine.clone();
        let source = self.settings.source.clone();
        let root = self.settings.shared_root.clone();

        run_blocking(&self.settings.shared_root, move || {
            let name = naming::snapshot_name(&machine, now);
            let path = root.join(&name);

            snapshot_slot_free(fs.as_ref(), &path)?;
            fs.create_dir(&path)?;
            let copy = fs.copy_tree(&source, &path)?;
            debug!(files = copy.files, "Copied source into {}", name);

            let mut record = store
                .load(&machine)
                .map_err(SyncError::state_store)?
                .unwrap_or_else(|| SyncRecord::new(machine.clone()));
            record.record_success(clock.now(), path.display().to_string());
            store.save(&record).map_err(SyncError::state_store)?;

            let snapshot = BackupSnapshot {
                machine_id: machine,
                created_at: naming::truncate_to_minute(now),
                name,
                path,
            };
            Ok((snapshot, copy, record))
        })
        .await
    }

    async fn release_lock(&self, marker: LockMarker) -> Result<()> {
        let locks = self.locks.clone();
        run_blocking(&self.settings.shared_root, move || locks.release(&marker)).await
    }

    /// Best effort: a store that cannot be written keeps its previous record.
    /// A machine that never synced successfully has no record to update.
    async fn record_failure(&self, err: &SyncError) {
        let store = self.store.clone();
        let machine = self.machine.clone();
        let message = err.to_string();

        let saved = run_blocking(&self.settings.shared_root, move || {
            let Some(mut record) = store.load(&machine).map_err(SyncError::state_store)? else {
                debug!(machine = %machine, "No sync record yet, failure not recorded");
                return Ok(());
            };
            record.record_failure(message);
            store.save(&record).map_err(SyncError::state_store)
        })
        .await;

        if let Err(e) = saved {
            warn!("Could not record failed sync: {}", e);
        }
    }

    async fn prune(&self, warnings: &mut Vec<String>) -> PruneReport {
        let retention = self.retention.clone();
        let machine = self.machine.clone();
        let keep = self.settings.retention;

        match run_blocking(&self.settings.shared_root, move || retention.prune(&machine, keep)).await {
            Ok(report) => {
                for failure in &report.failed {
                    warnings.push(format!("Old backup {} not removed: {}", failure.name, failure.error));
                }
                report
            }
            Err(e) => {
                warn!("Pruning skipped: {}", e);
                warnings.push(format!("Pruning skipped: {e}"));
                PruneReport::default()
            }
        }
    }

    fn begin_attempt(&self, trigger: Trigger) -> Option<AttemptGuard<'_>> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != SyncStatus::Idle {
            return None;
        }

        *phase = SyncStatus::Syncing;
        let now = self.clock.now();
        self.status.update(|s| {
            s.state = SyncStatus::Syncing;
            s.trigger = Some(trigger);
            s.since = now;
        });

        Some(AttemptGuard { orchestrator: self })
    }

    fn complete_attempt(&self, outcome: SyncStatus, trigger: Trigger, message: String, error_code: Option<String>) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(phase.can_transition_to(outcome));

        *phase = outcome;
        let now = self.clock.now();
        self.status.update(|s| {
            s.state = outcome;
            s.since = now;
            s.last_attempt = Some(AttemptSummary {
                status: outcome,
                trigger,
                finished_at: now,
                message,
                error_code,
            });
        });
    }

    fn finish_attempt(&self) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == SyncStatus::Syncing {
            warn!("Sync attempt ended without an outcome");
        }

        *phase = SyncStatus::Idle;
        let now = self.clock.now();
        self.status.update(|s| {
            s.state = SyncStatus::Idle;
            s.trigger = None;
            s.since = now;
        });
    }
}

fn snapshot_slot_free(fs: &dyn FileSystemGateway, path: &Path) -> Result<()> {
    if fs.exists(path) {
        return Err(SyncError::ConflictDetected(format!(
            "snapshot {} already exists; retry in the next minute",
            path.display()
        )));
    }
    Ok(())
}

/// Run filesystem or store work on the blocking pool.
async fn run_blocking<T, F>(context: &Path, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) => Err(FilesystemError::new("background task", context, std::io::Error::other(e.to_string())).into()),
    }
}
