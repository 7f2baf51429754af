//! Advisory file locking for job state access
//!
//! Locks are taken on a per-identity lock file with fd-lock. Acquisition is
//! bounded: the lock is polled until the timeout elapses, after which the
//! caller gets [`StoreError::Busy`] instead of blocking forever.

use super::store::StoreError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Interval between lock acquisition attempts
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lock scoped to one job identity
#[derive(Debug, Clone)]
pub struct StateLock {
    path: PathBuf,
    timeout: Duration,
}

impl StateLock {
    /// Create a lock handle for the given lock file
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Maximum time spent waiting for the lock
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` while holding the exclusive lock
    pub fn exclusive<T>(
        &self,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut lock = RwLock::new(self.open()?);
        let started = Instant::now();
        loop {
            match lock.try_write() {
                Ok(_guard) => return f(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(StoreError::Lock(format!(
                        "Failed to acquire write lock on {}: {e}",
                        self.path.display()
                    )))
                }
            }
            self.wait_or_busy(started)?;
        }
    }

    /// Run `f` while holding a shared lock
    pub fn shared<T>(&self, f: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let lock = RwLock::new(self.open()?);
        let started = Instant::now();
        loop {
            match lock.try_read() {
                Ok(_guard) => return f(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(StoreError::Lock(format!(
                        "Failed to acquire read lock on {}: {e}",
                        self.path.display()
                    )))
                }
            }
            self.wait_or_busy(started)?;
        }
    }

    fn wait_or_busy(&self, started: Instant) -> Result<(), StoreError> {
        let waited = started.elapsed();
        if waited >= self.timeout {
            debug!(path = %self.path.display(), ?waited, "Lock wait timed out");
            return Err(StoreError::Busy {
                resource: self.path.display().to_string(),
                waited,
            });
        }
        std::thread::sleep(LOCK_POLL_INTERVAL.min(self.timeout - waited));
        Ok(())
    }

    fn open(&self) -> Result<File, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StoreError::Lock(format!("Failed to open lock file: {e}")))
    }
}
