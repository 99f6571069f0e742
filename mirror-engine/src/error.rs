//! Error types for the synchronization engine.

use crate::lock::LockMarker;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A failed filesystem operation against the source tree or the shared root.
#[derive(Error, Debug)]
#[error("{op} failed for {}: {source}", path.display())]
pub struct FilesystemError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl FilesystemError {
    pub fn new(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.source.kind() == std::io::ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.source.kind() == std::io::ErrorKind::AlreadyExists
    }
}

/// How loudly a failure should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Source application is running")]
    SourceApplicationRunning,

    #[error("Lock file exists: {0}")]
    LockFileExists(LockMarker),

    #[error("Stale lock file found: {0}")]
    StaleLockFile(LockMarker),

    #[error("Source directory not found: {}", .0.display())]
    SourceDirectoryNotFound(PathBuf),

    #[error("Backup storage not available: {}", .0.display())]
    BackendNotAvailable(PathBuf),

    #[error("Filesystem operation failed: {0}")]
    FilesystemOperationFailed(#[from] FilesystemError),

    #[error("Invalid directory structure: {0}")]
    InvalidDirectoryStructure(String),

    #[error("Conflict detected: {0}")]
    ConflictDetected(String),

    #[error("No backup found for {0}")]
    NoBackupFound(String),

    #[error("State store failed: {0}")]
    StateStoreFailed(String),
}

impl SyncError {
    /// Stable identifier used in logs, records and the status API.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::SourceApplicationRunning => "sourceApplicationRunning",
            SyncError::LockFileExists(_) => "lockFileExists",
            SyncError::StaleLockFile(_) => "staleLockFile",
            SyncError::SourceDirectoryNotFound(_) => "sourceDirectoryNotFound",
            SyncError::BackendNotAvailable(_) => "backendNotAvailable",
            SyncError::FilesystemOperationFailed(_) => "filesystemOperationFailed",
            SyncError::InvalidDirectoryStructure(_) => "invalidDirectoryStructure",
            SyncError::ConflictDetected(_) => "conflictDetected",
            SyncError::NoBackupFound(_) => "noBackupFound",
            SyncError::StateStoreFailed(_) => "stateStoreFailed",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SyncError::StaleLockFile(_) | SyncError::ConflictDetected(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Short headline for user-facing notifications.
    pub fn title(&self) -> &'static str {
        match self {
            SyncError::SourceApplicationRunning => "Backup postponed",
            SyncError::LockFileExists(_) => "Backup locked by another sync",
            SyncError::StaleLockFile(_) => "Stale lock file removed",
            SyncError::SourceDirectoryNotFound(_) => "Data folder missing",
            SyncError::BackendNotAvailable(_) => "Backup storage unavailable",
            SyncError::FilesystemOperationFailed(_) => "Backup failed",
            SyncError::InvalidDirectoryStructure(_) => "Invalid data folder",
            SyncError::ConflictDetected(_) => "Concurrent use detected",
            SyncError::NoBackupFound(_) => "No backup found",
            SyncError::StateStoreFailed(_) => "Backup status not saved",
        }
    }

    pub(crate) fn state_store(err: anyhow::Error) -> Self {
        SyncError::StateStoreFailed(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
