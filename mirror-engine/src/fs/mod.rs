//! Filesystem gateway.
//!
//! All engine access to the source tree and the shared backup root goes
//! through [`FileSystemGateway`]. Calls are blocking and may run for a long
//! time (whole-tree copies); async callers move them onto the blocking pool.
//! Nothing is retried here.

pub mod metadata;
pub mod walker;

use crate::error::FilesystemError;
use chrono::{DateTime, Utc};
use metadata::EntryAttributes;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;
use walker::{walk_tree, WalkOptions};

/// A directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub is_dir: bool,
}

/// Totals for a completed tree copy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

pub trait FileSystemGateway: Send + Sync {
    /// List the direct children of `path`
    fn list(&self, path: &Path) -> Result<Vec<DirEntry>, FilesystemError>;

    /// Copy every directory and regular file below `src` into `dst`
    fn copy_tree(&self, src: &Path, dst: &Path) -> Result<CopyStats, FilesystemError>;

    /// Create a directory and any missing parents
    fn create_dir(&self, path: &Path) -> Result<(), FilesystemError>;

    /// Create an empty file; fails if the path already exists
    fn touch(&self, path: &Path) -> Result<(), FilesystemError>;

    /// Remove a file or a whole directory tree
    fn remove(&self, path: &Path) -> Result<(), FilesystemError>;

    fn exists(&self, path: &Path) -> bool;

    /// Attributes of the entry a path resolves to, following symlinks
    fn attributes(&self, path: &Path) -> Result<EntryAttributes, FilesystemError>;
}

/// Gateway backed by the local filesystem (including mounted cloud folders).
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    walk_options: WalkOptions,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_walk_options(walk_options: WalkOptions) -> Self {
        Self { walk_options }
    }
}

impl FileSystemGateway for LocalFileSystem {
    fn list(&self, path: &Path) -> Result<Vec<DirEntry>, FilesystemError> {
        let read_dir = fs::read_dir(path).map_err(|e| FilesystemError::new("list", path, e))?;
        let mut entries = Vec::new();

        for entry in read_dir {
            let entry = entry.map_err(|e| FilesystemError::new("list", path, e))?;
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // Removed between readdir and stat, e.g. a marker released by another machine
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Entry vanished while listing: {}", entry.path().display());
                    continue;
                }
                Err(e) => return Err(FilesystemError::new("stat", entry.path(), e)),
            };
            let attrs = EntryAttributes::from_metadata(&metadata);

            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                created_at: attrs.created_at,
                is_dir: attrs.is_dir,
            });
        }

        Ok(entries)
    }

    fn copy_tree(&self, src: &Path, dst: &Path) -> Result<CopyStats, FilesystemError> {
        let entries =
            walk_tree(src, &self.walk_options).map_err(|e| FilesystemError::new("walk", src, e))?;
        let mut stats = CopyStats::default();

        fs::create_dir_all(dst).map_err(|e| FilesystemError::new("create_dir", dst, e))?;

        for entry in entries {
            let target = dst.join(&entry.relative_path);

            if entry.is_dir {
                fs::create_dir_all(&target)
                    .map_err(|e| FilesystemError::new("create_dir", &target, e))?;
                stats.directories += 1;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| FilesystemError::new("create_dir", parent, e))?;
            }
            let copied =
                fs::copy(&entry.path, &target).map_err(|e| FilesystemError::new("copy", &entry.path, e))?;

            stats.files += 1;
            stats.bytes += copied;
        }

        debug!(
            files = stats.files,
            directories = stats.directories,
            bytes = stats.bytes,
            "Copied {} -> {}",
            src.display(),
            dst.display()
        );

        Ok(stats)
    }

    fn create_dir(&self, path: &Path) -> Result<(), FilesystemError> {
        fs::create_dir_all(path).map_err(|e| FilesystemError::new("create_dir", path, e))
    }

    fn touch(&self, path: &Path) -> Result<(), FilesystemError> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map(|_| ())
            .map_err(|e| FilesystemError::new("touch", path, e))
    }

    fn remove(&self, path: &Path) -> Result<(), FilesystemError> {
        let metadata =
            fs::symlink_metadata(path).map_err(|e| FilesystemError::new("remove", path, e))?;

        let result = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };

        result.map_err(|e| FilesystemError::new("remove", path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        EntryAttributes::from_path(path).is_ok()
    }

    fn attributes(&self, path: &Path) -> Result<EntryAttributes, FilesystemError> {
        fs::metadata(path)
            .map(|metadata| EntryAttributes::from_metadata(&metadata))
            .map_err(|e| FilesystemError::new("attributes", path, e))
    }
}
