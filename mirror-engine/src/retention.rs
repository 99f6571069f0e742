//! Per-machine snapshot rotation in the shared root.

use crate::error::{Result, SyncError};
use crate::fs::FileSystemGateway;
use crate::naming::{self, MachineId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_RETENTION: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub machine_id: MachineId,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub path: PathBuf,
}

impl BackupSnapshot {
    /// Describe a snapshot directory from its name, if it follows the convention.
    pub fn from_name(root: &Path, name: &str) -> Option<Self> {
        let stamped = naming::parse_snapshot_name(name)?;
        Some(Self {
            machine_id: stamped.machine,
            created_at: stamped.created_at,
            name: name.to_string(),
            path: root.join(name),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub kept: usize,
    pub removed: Vec<String>,
    pub failed: Vec<PruneFailure>,
}

#[derive(Clone)]
pub struct RetentionManager {
    fs: Arc<dyn FileSystemGateway>,
    root: PathBuf,
}

impl RetentionManager {
    pub fn new(fs: Arc<dyn FileSystemGateway>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    /// Snapshots owned by exactly `machine`, newest first.
    ///
    /// Equal timestamps are ordered by name so pruning is deterministic.
    pub fn list_snapshots(&self, machine: &MachineId) -> Result<Vec<BackupSnapshot>> {
        let entries = self.fs.list(&self.root).map_err(|e| {
            warn!("Cannot list backup root: {}", e);
            SyncError::BackendNotAvailable(self.root.clone())
        })?;

        let mut snapshots: Vec<BackupSnapshot> = entries
            .into_iter()
            .filter(|entry| entry.is_dir)
            .filter_map(|entry| BackupSnapshot::from_name(&self.root, &entry.name))
            .filter(|snapshot| &snapshot.machine_id == machine)
            .collect();

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
        Ok(snapshots)
    }

    pub fn latest_snapshot(&self, machine: &MachineId) -> Result<BackupSnapshot> {
        self.list_snapshots(machine)?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NoBackupFound(machine.to_string()))
    }

    /// Delete every snapshot of `machine` beyond the `keep` most recent.
    ///
    /// Deletion runs oldest first and continues past individual failures.
    pub fn prune(&self, machine: &MachineId, keep: usize) -> Result<PruneReport> {
        let snapshots = self.list_snapshots(machine)?;
        let mut report = PruneReport {
            kept: snapshots.len().min(keep),
            ..Default::default()
        };

        for snapshot in snapshots.iter().skip(keep).rev() {
            match self.fs.remove(&snapshot.path) {
                Ok(()) => {
                    info!(machine = %machine, "Removed old backup {}", snapshot.name);
                    report.removed.push(snapshot.name.clone());
                }
                Err(e) => {
                    warn!(machine = %machine, "Failed to remove old backup {}: {}", snapshot.name, e);
                    report.failed.push(PruneFailure {
                        name: snapshot.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilesystemError;
    use crate::fs::metadata::EntryAttributes;
    use crate::fs::{CopyStats, DirEntry, LocalFileSystem};
    use std::fs;
    use tempfile::TempDir;

    fn machine(name: &str) -> MachineId {
        MachineId::new(name).unwrap()
    }

    fn mkdirs(root: &Path, names: &[&str]) {
        for name in names {
            fs::create_dir(root.join(name)).unwrap();
        }
    }

    fn manager(root: &Path) -> RetentionManager {
        RetentionManager::new(Arc::new(LocalFileSystem::new()), root)
    }

    #[test]
    fn test_list_filters_by_exact_machine() {
        let dir = TempDir::new().unwrap();
        mkdirs(
            dir.path(),
            &[
                "2024-01-01_1000_mac",
                "2024-01-02_1000_mac",
                "2024-01-03_1000_macbook",
                "2024-01-04_1000_imac",
                "unrelated",
            ],
        );
        fs::write(dir.path().join("2024-01-05_1000_mac.lockfile"), b"").unwrap();

        let names: Vec<_> = manager(dir.path())
            .list_snapshots(&machine("mac"))
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();

        assert_eq!(names, vec!["2024-01-02_1000_mac", "2024-01-01_1000_mac"]);
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        mkdirs(
            dir.path(),
            &[
                "2024-01-01_1000_A",
                "2024-01-02_1000_A",
                "2024-01-03_1000_A",
                "2024-01-04_1000_A",
                "2024-01-05_1000_A",
                "2024-01-01_0900_B",
            ],
        );

        let report = manager(dir.path()).prune(&machine("A"), 3).unwrap();

        assert_eq!(report.kept, 3);
        assert_eq!(report.removed, vec!["2024-01-01_1000_A", "2024-01-02_1000_A"]);
        assert!(dir.path().join("2024-01-05_1000_A").exists());
        assert!(dir.path().join("2024-01-03_1000_A").exists());
        assert!(dir.path().join("2024-01-01_0900_B").exists());
    }

    #[test]
    fn test_prune_under_cap_is_noop() {
        let dir = TempDir::new().unwrap();
        mkdirs(dir.path(), &["2024-01-01_1000_A"]);

        let report = manager(dir.path()).prune(&machine("A"), 3).unwrap();
        assert_eq!(report.kept, 1);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_latest_snapshot_missing() {
        let dir = TempDir::new().unwrap();
        let err = manager(dir.path()).latest_snapshot(&machine("A")).unwrap_err();
        assert_eq!(err.code(), "noBackupFound");
    }

    #[test]
    fn test_list_on_missing_root() {
        let dir = TempDir::new().unwrap();
        let err = manager(&dir.path().join("offline"))
            .list_snapshots(&machine("A"))
            .unwrap_err();
        assert_eq!(err.code(), "backendNotAvailable");
    }

    /// Lists a fixed set of snapshots and refuses to delete one of them.
    struct StubbornFs {
        names: Vec<&'static str>,
        stuck: &'static str,
        removed: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl FileSystemGateway for StubbornFs {
        fn list(&self, _path: &Path) -> std::result::Result<Vec<DirEntry>, FilesystemError> {
            Ok(self
                .names
                .iter()
                .map(|name| DirEntry {
                    name: name.to_string(),
                    created_at: Utc::now(),
                    is_dir: true,
                })
                .collect())
        }

        fn copy_tree(&self, _src: &Path, _dst: &Path) -> std::result::Result<CopyStats, FilesystemError> {
            unreachable!()
        }

        fn create_dir(&self, _path: &Path) -> std::result::Result<(), FilesystemError> {
            unreachable!()
        }

        fn touch(&self, _path: &Path) -> std::result::Result<(), FilesystemError> {
            unreachable!()
        }

        fn remove(&self, path: &Path) -> std::result::Result<(), FilesystemError> {
            if path.ends_with(self.stuck) {
                return Err(FilesystemError::new(
                    "remove",
                    path,
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "busy"),
                ));
            }
            self.removed.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn exists(&self, _path: &Path) -> bool {
            true
        }

        fn attributes(&self, _path: &Path) -> std::result::Result<EntryAttributes, FilesystemError> {
            unreachable!()
        }
    }

    #[test]
    fn test_prune_continues_after_failure() {
        let fs = Arc::new(StubbornFs {
            names: vec![
                "2024-01-01_1000_A",
                "2024-01-02_1000_A",
                "2024-01-03_1000_A",
                "2024-01-04_1000_A",
            ],
            stuck: "2024-01-01_1000_A",
            removed: Default::default(),
        });
        let manager = RetentionManager::new(fs.clone(), "/cloud");

        let report = manager.prune(&machine("A"), 2).unwrap();

        assert_eq!(report.removed, vec!["2024-01-02_1000_A"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "2024-01-01_1000_A");
        assert_eq!(fs.removed.lock().unwrap().len(), 1);
    }
}
