use crate::error::CacheError;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

/// A cooperative marker-file lock scoped to one metadata file.
///
/// Acquisition is non-blocking: when the marker already exists the lock is
/// busy and the caller skips its critical section. The marker is removed on
/// drop, on every exit path. A process that crashes between acquire and
/// release leaves the marker orphaned; there is deliberately no owner, PID
/// or mtime heuristic here, and the remedy is manual removal of the marker
/// file (every busy-lock log line says so).
#[derive(Debug)]
pub struct CacheLockFile {
    path: PathBuf,
}

impl CacheLockFile {
    /// Try to acquire the lock at `path`. Returns `Ok(None)` immediately
    /// when the lock is already held.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_file) => Ok(Some(Self {
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLockFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    target = "kiln.cache",
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove cache lock marker; remove it manually before the next flush"
                );
            }
        }
    }
}

/// Standard busy-lock log line: every skipped critical section names the
/// marker file and the manual remedy.
pub(crate) fn warn_lock_busy(lock_path: &Path, dir: &Path, skipped: &str) {
    tracing::warn!(
        target = "kiln.cache",
        lock = %lock_path.display(),
        dir = %dir.display(),
        "cache lock is busy; skipping {skipped}. If no other process is using this cache, delete the lock file and retry"
    );
}
