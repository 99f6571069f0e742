//! Entry attributes for the filesystem gateway.
//!
//! Creation time is not available on every filesystem (notably some network
//! and FUSE mounts used for cloud storage), so it falls back to the
//! modification time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Attributes of a single filesystem entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAttributes {
    /// Creation time, or modification time where birth time is unsupported
    pub created_at: DateTime<Utc>,

    /// Size in bytes (0 for directories on most platforms)
    pub size: u64,

    /// Is this a directory?
    pub is_dir: bool,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl EntryAttributes {
    /// Read attributes without following symlinks
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        Self {
            created_at: DateTime::<Utc>::from(created),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
        }
    }
}
