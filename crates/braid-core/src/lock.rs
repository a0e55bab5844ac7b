//! Advisory file locking for cross-process coordination.
//!
//! The event log is the only shared mutable resource, so the locking story
//! is small: one lock file next to the log, exclusive for appends and
//! rewrites, shared for reads. Locks are advisory (`flock` via `fs2`), which
//! is the only primitive direct one-shot clients and the daemon have in
//! common.
//!
//! Acquisition polls with a short sleep rather than blocking, so a wedged
//! peer surfaces as a [`LockError::Timeout`] instead of a hang.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;

/// How long lock acquisition waits before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a contended lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out waiting for lock on {path} after {waited:?}", path = .path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("lock file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// An acquired advisory lock, released on drop.
#[derive(Debug)]
pub struct FileGuard {
    file: File,
    path: PathBuf,
}

impl FileGuard {
    /// Acquire an exclusive lock, polling until `timeout` elapses.
    pub fn acquire_exclusive(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Self::acquire_with(path, timeout, |file| file.try_lock_exclusive())
    }

    /// Acquire a shared lock, polling until `timeout` elapses.
    pub fn acquire_shared(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Self::acquire_with(path, timeout, |file| FileExt::try_lock_shared(file))
    }

    fn acquire_with(
        path: &Path,
        timeout: Duration,
        try_lock: impl Fn(&File) -> std::io::Result<()>,
    ) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let start = Instant::now();
        loop {
            match try_lock(&file) {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        return Err(LockError::Timeout {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(err) => return Err(LockError::Io(err)),
            }
        }
    }

    /// Path of the lock file this guard holds.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly. Dropping the guard does the same; this
    /// exists for call sites that want to release before end of scope and
    /// surface unlock errors.
    pub fn release(self) -> Result<(), LockError> {
        fs2::FileExt::unlock(&self.file)?;
        Ok(())
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        // Errors on unlock are unreportable here; the OS drops the lock
        // when the descriptor closes anyway.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

// ---------------------------------------------------------------------------
// Log lock wrappers
// ---------------------------------------------------------------------------

/// Exclusive lock held for the duration of an append or rewrite.
#[derive(Debug)]
pub struct LogWriteLock {
    guard: FileGuard,
}

impl LogWriteLock {
    pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let guard = FileGuard::acquire_exclusive(lock_path, timeout)?;
        Ok(Self { guard })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.guard.path()
    }

    pub fn release(self) -> Result<(), LockError> {
        self.guard.release()
    }
}

/// Shared lock held while reading the log, so readers never observe a
/// rewrite mid-rename.
#[derive(Debug)]
pub struct LogReadLock {
    guard: FileGuard,
}

impl LogReadLock {
    pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let guard = FileGuard::acquire_shared(lock_path, timeout)?;
        Ok(Self { guard })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.guard.path()
    }

    pub fn release(self) -> Result<(), LockError> {
        self.guard.release()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
