//! Advisory lock around mutating passes.
//!
//! Two operators reconciling the same host concurrently would interleave
//! package installs and service restarts; the whole pass runs under one
//! exclusive flock. The lock is advisory only — nothing stops a raw shell
//! from mutating the host — but both relayctl passes respect it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::ReconcileError;

/// Held advisory lock; released on drop.
#[derive(Debug)]
pub struct PassLock {
    path: PathBuf,
    // Held for the flock; never read.
    _file: File,
}

impl PassLock {
    /// Acquire the lock, failing immediately when it is already held.
    ///
    /// # Errors
    ///
    /// Returns `Locked` when another pass holds the lock, or an I/O error
    /// when the lock file cannot be created.
    pub fn acquire(path: &Path) -> Result<Self, ReconcileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| ReconcileError::Locked {
                path: path.to_path_buf(),
            })?;

        debug!(path = %path.display(), "acquired pass lock");
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass.lock");

        let held = PassLock::acquire(&path).unwrap();
        let err = PassLock::acquire(&path).unwrap_err();
        assert!(matches!(err, ReconcileError::Locked { .. }));

        drop(held);
        PassLock::acquire(&path).unwrap();
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/relayctl/pass.lock");
        PassLock::acquire(&path).unwrap();
        assert!(path.exists());
    }
}
