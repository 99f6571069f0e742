//! Advisory cross-machine locking through marker files in the shared root.
//!
//! The shared root is the only channel machines share, so exclusion is
//! cooperative: a marker named `{timestamp}_{machine}.lockfile` announces a
//! sync (or an open data session) in progress. Markers strictly older than
//! the staleness threshold are treated as abandoned.

use crate::error::{Result, SyncError};
use crate::fs::FileSystemGateway;
use crate::naming::{self, MachineId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_STALE_AFTER_HOURS: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMarker {
    pub machine_id: MachineId,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
}

impl LockMarker {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Strictly older than `stale_after` counts as abandoned.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.age(now) > stale_after
    }
}

impl fmt::Display for LockMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (held by {} since {})",
            self.name(),
            self.machine_id,
            self.created_at.format("%Y-%m-%d %H:%M UTC")
        )
    }
}

/// Result of inspecting the shared root without touching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockProbe {
    Free,
    Busy(LockMarker),
    Stale(LockMarker),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired(LockMarker),
    Busy(LockMarker),
    Stale(LockMarker),
}

/// A marker placed unconditionally, together with the live markers of other
/// machines that were already present.
#[derive(Debug, Clone)]
pub struct PlacedMarker {
    pub marker: LockMarker,
    pub conflicts: Vec<LockMarker>,
}

#[derive(Clone)]
pub struct LockCoordinator {
    fs: Arc<dyn FileSystemGateway>,
    root: PathBuf,
    stale_after: Duration,
}

impl LockCoordinator {
    pub fn new(fs: Arc<dyn FileSystemGateway>, root: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            fs,
            root: root.into(),
            stale_after,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// All markers in the shared root, oldest first.
    ///
    /// A missing root yields no markers; its absence is reported by the
    /// backend availability check instead.
    pub fn markers(&self) -> Result<Vec<LockMarker>> {
        let entries = match self.fs.list(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => {
                warn!("Cannot list backup root for lock files: {}", e);
                return Err(SyncError::BackendNotAvailable(self.root.clone()));
            }
        };

        let mut markers: Vec<LockMarker> = entries
            .into_iter()
            .filter(|entry| naming::is_lock_name(&entry.name))
            .map(|entry| {
                let path = self.root.join(&entry.name);
                match naming::parse_lock_name(&entry.name) {
                    Some(stamped) => LockMarker {
                        machine_id: stamped.machine,
                        created_at: stamped.created_at,
                        path,
                    },
                    None => {
                        debug!("Lock file with foreign name: {}", entry.name);
                        LockMarker {
                            machine_id: MachineId::unknown(),
                            created_at: entry.created_at,
                            path,
                        }
                    }
                }
            })
            .collect();

        markers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.path.cmp(&b.path)));
        Ok(markers)
    }

    /// Any live marker makes the root busy; otherwise the oldest stale
    /// marker is reported so the caller can clear it.
    pub fn probe(&self, now: DateTime<Utc>) -> Result<LockProbe> {
        let markers = self.markers()?;

        if let Some(live) = markers.iter().rev().find(|m| !m.is_stale(now, self.stale_after)) {
            return Ok(LockProbe::Busy(live.clone()));
        }

        Ok(match markers.into_iter().next() {
            Some(stale) => LockProbe::Stale(stale),
            None => LockProbe::Free,
        })
    }

    /// Place this machine's marker if the root is free.
    ///
    /// The root is listed again after the marker is written. Contenders that
    /// both saw a free root find each other there and both back off, so at
    /// most one of them ever holds the lock.
    pub fn acquire(&self, machine: &MachineId, now: DateTime<Utc>) -> Result<LockAcquisition> {
        match self.probe(now)? {
            LockProbe::Busy(existing) => return Ok(LockAcquisition::Busy(existing)),
            LockProbe::Stale(existing) => return Ok(LockAcquisition::Stale(existing)),
            LockProbe::Free => {}
        }

        let marker = self.marker_for(machine, now);
        match self.fs.touch(&marker.path) {
            Ok(()) => {}
            // Another attempt won the race within the same minute
            Err(e) if e.is_already_exists() => return Ok(LockAcquisition::Busy(marker)),
            Err(e) => return Err(e.into()),
        }

        let markers = match self.markers() {
            Ok(markers) => markers,
            Err(e) => {
                let _ = self.release(&marker);
                return Err(e);
            }
        };

        let rival = markers
            .into_iter()
            .find(|m| m.path != marker.path && !m.is_stale(now, self.stale_after));
        if let Some(rival) = rival {
            warn!("Lock contended by {}, backing off", rival);
            self.release(&marker)?;
            return Ok(LockAcquisition::Busy(rival));
        }

        info!("Acquired lock {}", marker.name());
        Ok(LockAcquisition::Acquired(marker))
    }

    /// Remove a marker. An already-missing marker counts as released.
    pub fn release(&self, marker: &LockMarker) -> Result<()> {
        match self.fs.remove(&marker.path) {
            Ok(()) => {
                info!("Released lock {}", marker.name());
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Lock {} already gone", marker.name());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to release lock {}: {}", marker.name(), e);
                Err(e.into())
            }
        }
    }

    /// Remove a marker that has outlived the staleness threshold.
    pub fn force_release(&self, marker: &LockMarker, now: DateTime<Utc>) -> Result<()> {
        warn!(
            machine = %marker.machine_id,
            age_minutes = marker.age(now).num_minutes(),
            "Removing stale lock file {}",
            marker.name()
        );
        self.release(marker)
    }

    /// Create this machine's marker regardless of existing ones.
    ///
    /// Live markers of other machines are returned as conflicts. If this
    /// machine already holds a marker for the same minute it is reused.
    pub fn place(&self, machine: &MachineId, now: DateTime<Utc>) -> Result<PlacedMarker> {
        let conflicts: Vec<LockMarker> = self
            .markers()?
            .into_iter()
            .filter(|m| &m.machine_id != machine && !m.is_stale(now, self.stale_after))
            .collect();

        let marker = self.marker_for(machine, now);
        match self.fs.touch(&marker.path) {
            Ok(()) => info!("Placed session lock {}", marker.name()),
            Err(e) if e.is_already_exists() => debug!("Session lock {} already present", marker.name()),
            Err(e) => return Err(e.into()),
        }

        Ok(PlacedMarker { marker, conflicts })
    }

    fn marker_for(&self, machine: &MachineId, now: DateTime<Utc>) -> LockMarker {
        LockMarker {
            machine_id: machine.clone(),
            created_at: naming::truncate_to_minute(now),
            path: self.root.join(naming::lock_name(machine, now)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilesystemError;
    use crate::fs::metadata::EntryAttributes;
    use crate::fs::{CopyStats, DirEntry, LocalFileSystem};
    use chrono::TimeZone;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn coordinator(root: &Path) -> LockCoordinator {
        LockCoordinator::new(
            Arc::new(LocalFileSystem::new()),
            root,
            Duration::hours(DEFAULT_STALE_AFTER_HOURS),
        )
    }

    fn machine(name: &str) -> MachineId {
        MachineId::new(name).unwrap()
    }

    fn write_marker(root: &Path, name: &str, at: DateTime<Utc>) {
        fs::write(root.join(naming::lock_name(&machine(name), at)), b"").unwrap();
    }

    #[test]
    fn test_acquire_on_empty_root() {
        let dir = TempDir::new().unwrap();
        let lock = coordinator(dir.path());

        match lock.acquire(&machine("home"), now()).unwrap() {
            LockAcquisition::Acquired(marker) => {
                assert_eq!(marker.name(), "2024-06-01_1200_home.lockfile");
                assert!(marker.path.exists());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = TempDir::new().unwrap();
        let lock = coordinator(dir.path());

        lock.acquire(&machine("home"), now()).unwrap();
        let later = now() + Duration::minutes(30);

        match lock.acquire(&machine("office"), later).unwrap() {
            LockAcquisition::Busy(existing) => assert_eq!(existing.machine_id.as_str(), "home"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_marker_older_than_threshold_is_stale() {
        let dir = TempDir::new().unwrap();
        write_marker(dir.path(), "office", now() - Duration::hours(5));
        let lock = coordinator(dir.path());

        match lock.acquire(&machine("home"), now()).unwrap() {
            LockAcquisition::Stale(existing) => {
                assert_eq!(existing.machine_id.as_str(), "office");
                lock.force_release(&existing, now()).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            lock.acquire(&machine("home"), now()).unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[test]
    fn test_marker_exactly_at_threshold_is_busy() {
        let dir = TempDir::new().unwrap();
        write_marker(dir.path(), "office", now() - Duration::hours(4));
        let lock = coordinator(dir.path());

        assert!(matches!(lock.probe(now()).unwrap(), LockProbe::Busy(_)));
    }

    #[test]
    fn test_live_marker_wins_over_stale() {
        let dir = TempDir::new().unwrap();
        write_marker(dir.path(), "old", now() - Duration::hours(9));
        write_marker(dir.path(), "fresh", now() - Duration::minutes(10));
        let lock = coordinator(dir.path());

        match lock.probe(now()).unwrap() {
            LockProbe::Busy(marker) => assert_eq!(marker.machine_id.as_str(), "fresh"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_root_is_free() {
        let dir = TempDir::new().unwrap();
        let lock = coordinator(&dir.path().join("not-mounted"));
        assert_eq!(lock.probe(now()).unwrap(), LockProbe::Free);
    }

    #[test]
    fn test_release_missing_marker_is_ok() {
        let dir = TempDir::new().unwrap();
        let lock = coordinator(dir.path());
        let marker = lock.marker_for(&machine("home"), now());
        lock.release(&marker).unwrap();
    }

    #[test]
    fn test_place_reports_other_machines() {
        let dir = TempDir::new().unwrap();
        write_marker(dir.path(), "office", now() - Duration::minutes(5));
        write_marker(dir.path(), "attic", now() - Duration::hours(6));
        let lock = coordinator(dir.path());

        let placed = lock.place(&machine("home"), now()).unwrap();
        assert_eq!(placed.conflicts.len(), 1);
        assert_eq!(placed.conflicts[0].machine_id.as_str(), "office");
        assert!(placed.marker.path.exists());

        // Same minute again reuses the marker
        lock.place(&machine("home"), now()).unwrap();
    }

    /// Holds the first `list` of each contender until both have listed, and
    /// each `touch` until both markers exist.
    struct InterleavedFs {
        inner: LocalFileSystem,
        lists: AtomicUsize,
        listed: Barrier,
        touched: Barrier,
    }

    impl InterleavedFs {
        fn new() -> Self {
            Self {
                inner: LocalFileSystem::new(),
                lists: AtomicUsize::new(0),
                listed: Barrier::new(2),
                touched: Barrier::new(2),
            }
        }
    }

    impl FileSystemGateway for InterleavedFs {
        fn list(&self, path: &Path) -> std::result::Result<Vec<DirEntry>, FilesystemError> {
            let entries = self.inner.list(path);
            if self.lists.fetch_add(1, Ordering::SeqCst) < 2 {
                self.listed.wait();
            }
            entries
        }

        fn copy_tree(&self, src: &Path, dst: &Path) -> std::result::Result<CopyStats, FilesystemError> {
            self.inner.copy_tree(src, dst)
        }

        fn create_dir(&self, path: &Path) -> std::result::Result<(), FilesystemError> {
            self.inner.create_dir(path)
        }

        fn touch(&self, path: &Path) -> std::result::Result<(), FilesystemError> {
            let touched = self.inner.touch(path);
            self.touched.wait();
            touched
        }

        fn remove(&self, path: &Path) -> std::result::Result<(), FilesystemError> {
            self.inner.remove(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn attributes(&self, path: &Path) -> std::result::Result<EntryAttributes, FilesystemError> {
            self.inner.attributes(path)
        }
    }

    #[test]
    fn test_concurrent_acquires_never_both_succeed() {
        let dir = TempDir::new().unwrap();
        let lock = LockCoordinator::new(
            Arc::new(InterleavedFs::new()),
            dir.path(),
            Duration::hours(DEFAULT_STALE_AFTER_HOURS),
        );

        let (home, laptop) = std::thread::scope(|scope| {
            let home = scope.spawn(|| lock.acquire(&machine("home"), now()).unwrap());
            let laptop = scope.spawn(|| lock.acquire(&machine("laptop"), now() + Duration::minutes(1)).unwrap());
            (home.join().unwrap(), laptop.join().unwrap())
        });

        let mut acquired = Vec::new();
        for (result, other) in [(home, "laptop"), (laptop, "home")] {
            match result {
                LockAcquisition::Acquired(marker) => acquired.push(marker.name()),
                LockAcquisition::Busy(rival) => assert_eq!(rival.machine_id.as_str(), other),
                LockAcquisition::Stale(marker) => panic!("unexpected stale {}", marker),
            }
        }
        assert!(acquired.len() <= 1, "both contenders hold the lock: {:?}", acquired);

        let held: Vec<_> = coordinator(dir.path())
            .markers()
            .unwrap()
            .into_iter()
            .map(|m| m.name())
            .collect();
        assert_eq!(held, acquired);
    }

    #[test]
    fn test_acquire_backs_off_from_marker_that_appeared() {
        let dir = TempDir::new().unwrap();
        let lock = coordinator(dir.path());
        let laptop = lock.marker_for(&machine("laptop"), now());

        struct LateMarkerFs {
            inner: LocalFileSystem,
            late: PathBuf,
            lists: AtomicUsize,
        }

        impl FileSystemGateway for LateMarkerFs {
            fn list(&self, path: &Path) -> std::result::Result<Vec<DirEntry>, FilesystemError> {
                let entries = self.inner.list(path);
                // Appears after the first listing, as if written concurrently
                if self.lists.fetch_add(1, Ordering::SeqCst) == 0 {
                    fs::write(&self.late, b"").unwrap();
                }
                entries
            }
            fn copy_tree(&self, src: &Path, dst: &Path) -> std::result::Result<CopyStats, FilesystemError> {
                self.inner.copy_tree(src, dst)
            }
            fn create_dir(&self, path: &Path) -> std::result::Result<(), FilesystemError> {
                self.inner.create_dir(path)
            }
            fn touch(&self, path: &Path) -> std::result::Result<(), FilesystemError> {
                self.inner.touch(path)
            }
            fn remove(&self, path: &Path) -> std::result::Result<(), FilesystemError> {
                self.inner.remove(path)
            }
            fn exists(&self, path: &Path) -> bool {
                self.inner.exists(path)
            }
            fn attributes(&self, path: &Path) -> std::result::Result<EntryAttributes, FilesystemError> {
                self.inner.attributes(path)
            }
        }

        let racy = LockCoordinator::new(
            Arc::new(LateMarkerFs {
                inner: LocalFileSystem::new(),
                late: laptop.path.clone(),
                lists: AtomicUsize::new(0),
            }),
            dir.path(),
            lock.stale_after(),
        );

        match racy.acquire(&machine("home"), now() + Duration::minutes(1)).unwrap() {
            LockAcquisition::Busy(rival) => assert_eq!(rival.machine_id.as_str(), "laptop"),
            other => panic!("unexpected {:?}", other),
        }
        let names: Vec<_> = lock.markers().unwrap().into_iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["2024-06-01_1200_laptop.lockfile"]);
    }

    #[test]
    fn test_foreign_lock_name_uses_file_time() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("manual.lockfile"), b"").unwrap();
        let lock = coordinator(dir.path());

        let markers = lock.markers().unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].machine_id, MachineId::unknown());
    }
}
