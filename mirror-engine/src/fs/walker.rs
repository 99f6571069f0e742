//! Source tree traversal for snapshot copies.
//!
//! Walks the data directory and yields every directory and regular file
//! below it. Symlinks are never followed and are left out of the copy.

use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

pub const DEFAULT_EXCLUDE: &str = ".DS_Store";

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Entry names to skip, matched exactly
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            exclude_names: vec![DEFAULT_EXCLUDE.to_string()],
        }
    }
}

/// An entry discovered during walking
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    pub is_dir: bool,
}

impl TreeEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> Self {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Self {
            path,
            relative_path,
            is_dir: entry.file_type().is_dir(),
        }
    }
}

/// Walk a directory tree and collect directories and regular files below `root`.
///
/// Parents are always yielded before their children, so the result can be
/// replayed in order to rebuild the tree elsewhere.
pub fn walk_tree(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();

    let iter = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, &options.exclude_names));

    for entry in iter {
        let entry = entry?;

        if entry.file_type().is_symlink() {
            debug!("Skipping symlink: {}", entry.path().display());
            continue;
        }

        entries.push(TreeEntry::from_entry(&entry, root));
    }

    Ok(entries)
}

fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|name| *name == file_name)
}
