//! Staging primitives of the write protocol.
//!
//! New content goes to a hidden `.<file>.flush` sibling of its target and is
//! published with a single `rename`. Deletions move the target to a `_del`
//! sibling and only become permanent on commit.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Suffix of staging files (they also carry a leading dot).
pub const STAGING_SUFFIX: &str = ".flush";

/// Suffix appended to a file or folder staged for deletion.
pub const DELETE_SUFFIX: &str = "_del";

/// A write that has reached its staging file but is not yet published.
#[derive(Debug)]
pub struct StagedWrite {
    staging: PathBuf,
    target: PathBuf,
}

impl StagedWrite {
    /// Create the staging file exclusively and write `bytes` to it.
    ///
    /// Fails with [`StoreError::StagingFileExists`] when the staging file is
    /// already present: another unit of work is flushing the same target.
    /// If writing fails after creation the staging file is removed again.
    pub fn create(
        staging: PathBuf,
        target: PathBuf,
        bytes: &[u8],
        sync: bool,
    ) -> StoreResult<Self> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::StagingFileExists(staging));
            }
            Err(e) => return Err(StoreError::at(&staging, e)),
        };

        let written = file
            .write_all(bytes)
            .and_then(|()| file.flush())
            .and_then(|()| if sync { file.sync_all() } else { Ok(()) });
        if let Err(e) = written {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "failed to remove partial staging file");
            }
            return Err(StoreError::at(&staging, e));
        }

        debug!(staging = %staging.display(), len = bytes.len(), "staging file written");
        Ok(Self { staging, target })
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn target_path(&self) -> &Path {
        &self.target
    }

    /// Assert early that the existing target can be replaced, by appending
    /// zero bytes to it. A missing target is fine.
    pub fn probe_target(&self) -> StoreResult<()> {
        match OpenOptions::new().append(true).open(&self.target) {
            Ok(mut file) => file
                .write_all(&[])
                .map_err(|e| StoreError::at(&self.target, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::at(&self.target, e)),
        }
    }

    /// Atomically move the staging file onto the target, replacing it.
    pub fn publish(&self) -> StoreResult<()> {
        fs::rename(&self.staging, &self.target).map_err(|e| StoreError::at(&self.target, e))?;
        debug!(target = %self.target.display(), "staging file published");
        Ok(())
    }

    /// Remove the staging file if it is still there.
    pub fn discard(&self) -> StoreResult<()> {
        remove_if_exists(&self.staging)
    }
}

/// A file or folder renamed to its `_del` sibling, pending commit.
#[derive(Debug)]
pub struct StagedDelete {
    original: PathBuf,
    staged: PathBuf,
}

impl StagedDelete {
    /// Path `original` is moved to while its deletion is pending.
    pub fn staged_path_for(original: &Path) -> PathBuf {
        let mut name = original
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(DELETE_SUFFIX);
        original.with_file_name(name)
    }

    /// Rename `original` to its `_del` sibling.
    ///
    /// Fails with [`StoreError::StagingFileExists`] if a `_del` sibling is
    /// already present, and with a `NotFound` I/O error if `original` is gone.
    pub fn stage(original: PathBuf) -> StoreResult<Self> {
        let staged = Self::staged_path_for(&original);
        if staged.exists() {
            return Err(StoreError::StagingFileExists(staged));
        }
        fs::rename(&original, &staged).map_err(|e| StoreError::at(&original, e))?;
        debug!(original = %original.display(), "deletion staged");
        Ok(Self { original, staged })
    }

    pub fn original_path(&self) -> &Path {
        &self.original
    }

    pub fn staged_path(&self) -> &Path {
        &self.staged
    }

    /// Permanently remove the staged path (recursively for folders).
    pub fn purge(&self) -> StoreResult<()> {
        let result = match fs::symlink_metadata(&self.staged) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&self.staged),
            Ok(_) => fs::remove_file(&self.staged),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| StoreError::at(&self.staged, e))?;
        debug!(path = %self.original.display(), "deletion committed");
        Ok(())
    }

    /// Move the staged path back to its original name if it still exists.
    pub fn restore(&self) -> StoreResult<()> {
        if !self.staged.exists() {
            return Ok(());
        }
        fs::rename(&self.staged, &self.original).map_err(|e| StoreError::at(&self.original, e))?;
        debug!(path = %self.original.display(), "deletion rolled back");
        Ok(())
    }
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::at(path, e)),
    }
}
