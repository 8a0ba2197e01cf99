// src/filesystem/mod.rs

//! Filesystem snapshots and change detection
//!
//! This module provides:
//! - [`FsTree`]: an arena tree of a directory with lazily hashed files
//! - [`FsDiff`]: the changes between two snapshots, and replaying them onto
//!   another directory
//! - copy helpers shared by staging and replay

mod diff;
mod tree;

pub use diff::{DiffEntry, DiffStatus, FsDiff, NEW_SUFFIX, ReplayDecision, ReplayReport};
pub use tree::{EntryId, EntryKind, FsEntry, FsTree};

use std::fs;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Copy one file or symlink, replacing whatever is at `dest`
pub fn copy_entry(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    if dest.symlink_metadata().is_ok() && !dest.is_dir() {
        fs::remove_file(dest).map_err(|e| Error::io(dest, e))?;
    }

    let metadata = fs::symlink_metadata(source).map_err(|e| Error::io(source, e))?;
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(source).map_err(|e| Error::io(source, e))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, dest).map_err(|e| Error::io(dest, e))?;
        #[cfg(not(unix))]
        fs::copy(source.parent().unwrap_or(source).join(&target), dest)
            .map_err(|e| Error::io(dest, e))?;
        return Ok(());
    }

    fs::copy(source, dest).map_err(|e| Error::io(dest, e))?;
    Ok(())
}

/// Copy the contents of `source` into `dest`, overlaying existing entries
///
/// Returns the number of files copied.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            match e.into_io_error() {
                Some(io) => Error::io(path, io),
                None => Error::Description(format!("filesystem loop at {}", path.display())),
            }
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::Description(format!("{} escapes {}", entry.path().display(), source.display())))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
        } else {
            copy_entry(entry.path(), &target)?;
            copied += 1;
        }
    }
    debug!("Copied {} files from {} to {}", copied, source.display(), dest.display());
    Ok(copied)
}

/// Remove a file, symlink or directory tree; missing paths are fine
pub fn remove_entry(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => {
            fs::remove_dir_all(path).map_err(|e| Error::io(path, e))
        }
        Ok(_) => fs::remove_file(path).map_err(|e| Error::io(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}
