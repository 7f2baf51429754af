//! Crash-consistent persistence of job state
//!
//! Every identity owns three files inside the store directory:
//!
//! - `<stem>.json`: the primary record
//! - `<stem>.backup.json`: the previous valid primary record
//! - `<stem>.lock`: advisory lock marker
//!
//! Records are written to a temporary file in the same directory, synced and
//! renamed into place, so a crash leaves either the old or the new record but
//! never a torn one. A primary that is nevertheless unreadable falls back to
//! the backup.

use super::lock::StateLock;
use super::state::{JobState, JobStatus, JobSummary, StateError};
use crate::identity::storage_stem;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time to wait for the per-identity lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum state file size (64 MiB)
pub const MAX_STATE_FILE_SIZE: u64 = 64 * 1024 * 1024;

const PRIMARY_SUFFIX: &str = ".json";
const BACKUP_SUFFIX: &str = ".backup.json";
const LOCK_SUFFIX: &str = ".lock";

/// Durable job state storage rooted at one directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    /// Open (and create if needed) a store directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Io(format!("Failed to create state directory {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Set the bounded lock wait
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bounded lock wait
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Path of the primary record for `identity`
    pub fn primary_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{}{PRIMARY_SUFFIX}", storage_stem(identity)))
    }

    /// Path of the backup record for `identity`
    pub fn backup_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{}{BACKUP_SUFFIX}", storage_stem(identity)))
    }

    /// Path of the lock file for `identity`
    pub fn lock_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{}{LOCK_SUFFIX}", storage_stem(identity)))
    }

    /// Lock handle for `identity`
    pub fn lock(&self, identity: &str) -> StateLock {
        StateLock::new(self.lock_path(identity), self.lock_timeout)
    }

    /// Load the state for `identity`.
    ///
    /// Falls back to the backup when the primary is unusable. Returns `None`
    /// when neither slot holds a valid record for this identity; corruption is
    /// logged, never raised.
    pub fn load(&self, identity: &str) -> Option<JobState> {
        match self.lock(identity).shared(|| Ok(self.read_slots(identity))) {
            Ok(state) => state,
            Err(e) => {
                warn!(identity, error = %e, "Shared lock unavailable, reading state unlocked");
                self.read_slots(identity)
            }
        }
    }

    fn read_slots(&self, identity: &str) -> Option<JobState> {
        let slots = [
            ("primary", self.primary_path(identity)),
            ("backup", self.backup_path(identity)),
        ];
        for (slot, path) in slots {
            match read_slot(&path) {
                Ok(Some(contents)) if contents.state.identity() == identity => {
                    if slot == "backup" {
                        warn!(identity, path = %path.display(), "Recovered job state from backup");
                    }
                    debug!(
                        identity,
                        slot,
                        status = %contents.state.status(),
                        completed = contents.state.completed_count(),
                        "Job state loaded"
                    );
                    return Some(contents.state);
                }
                Ok(Some(contents)) => {
                    warn!(
                        identity,
                        slot,
                        found = contents.state.identity(),
                        "State record belongs to another identity, ignoring"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(identity, slot, path = %path.display(), error = %e, "Unusable state record");
                }
            }
        }
        None
    }

    /// Persist `state` as the primary record for its identity.
    ///
    /// The previous primary, when valid, is preserved as the backup first.
    pub fn save(&self, state: &JobState) -> Result<(), StoreError> {
        state.validate()?;
        let identity = state.identity();
        let json = serde_json::to_string_pretty(&state.to_record()?)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let primary = self.primary_path(identity);
        let backup = self.backup_path(identity);

        self.lock(identity).exclusive(|| {
            match read_slot(&primary) {
                Ok(Some(current)) if current.state.identity() == identity => {
                    atomic_write(&self.dir, &backup, current.raw.as_bytes())?;
                }
                Ok(Some(current)) => {
                    warn!(
                        identity,
                        found = current.state.identity(),
                        "Primary belongs to another identity, not backing it up"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(identity, error = %e, "Primary record unusable, keeping existing backup");
                }
            }
            atomic_write(&self.dir, &primary, json.as_bytes())
        })?;

        debug!(
            identity,
            status = %state.status(),
            completed = state.completed_count(),
            total = state.total_units(),
            "Job state saved"
        );
        Ok(())
    }

    /// Remove the primary and backup records for `identity`. Idempotent.
    pub fn clear(&self, identity: &str) -> Result<(), StoreError> {
        let primary = self.primary_path(identity);
        let backup = self.backup_path(identity);
        self.lock(identity).exclusive(|| {
            remove_if_exists(&primary)?;
            remove_if_exists(&backup)
        })?;
        info!(identity, "Job state cleared");
        Ok(())
    }

    /// Whether a resumable job exists for `identity`
    pub fn has_incomplete_job(&self, identity: &str) -> bool {
        self.load(identity)
            .map(|state| state.is_resumable())
            .unwrap_or(false)
    }

    /// Summary of the job stored for `identity`
    pub fn summary(&self, identity: &str) -> Option<JobSummary> {
        self.load(identity).map(|state| state.summary())
    }

    /// Summaries of every loadable job in the store, ordered by identity
    pub fn list_jobs(&self) -> Result<Vec<JobSummary>, StoreError> {
        let mut jobs = Vec::new();
        for stem in self.stems()? {
            let slots = [
                self.dir.join(format!("{stem}{PRIMARY_SUFFIX}")),
                self.dir.join(format!("{stem}{BACKUP_SUFFIX}")),
            ];
            let state = slots.iter().find_map(|path| match read_slot(path) {
                Ok(Some(contents)) if storage_stem(contents.state.identity()) == stem => {
                    Some(contents.state)
                }
                _ => None,
            });
            match state {
                Some(state) => jobs.push(state.summary()),
                None => warn!(stem = %stem, "No loadable record, skipping"),
            }
        }
        jobs.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(jobs)
    }

    /// Health report of the primary and backup slot of every stored job
    pub fn verify(&self) -> Result<Vec<RecordHealth>, StoreError> {
        let mut report = Vec::new();
        for stem in self.stems()? {
            let primary = FileHealth::inspect(&self.dir.join(format!("{stem}{PRIMARY_SUFFIX}")));
            let backup = FileHealth::inspect(&self.dir.join(format!("{stem}{BACKUP_SUFFIX}")));
            report.push(RecordHealth {
                stem,
                primary,
                backup,
            });
        }
        Ok(report)
    }

    /// File stems that have a primary or backup record
    fn stems(&self) -> Result<BTreeSet<String>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            StoreError::Io(format!("Failed to read state directory {}: {e}", self.dir.display()))
        })?;

        let mut stems = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let stem = name
                .strip_suffix(BACKUP_SUFFIX)
                .or_else(|| name.strip_suffix(PRIMARY_SUFFIX));
            if let Some(stem) = stem.filter(|s| !s.is_empty() && !s.starts_with('.')) {
                stems.insert(stem.to_string());
            }
        }
        Ok(stems)
    }
}

/// Health of one record slot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum FileHealth {
    /// No file in this slot
    Missing,
    /// Record loads and validates
    Valid {
        /// Identity stored in the record
        identity: String,
        /// Status stored in the record
        status: JobStatus,
        /// Completed unit count
        completed_units: usize,
        /// Expected unit count
        total_units: usize,
    },
    /// Record cannot be used
    Corrupt {
        /// Why the record was rejected
        reason: String,
    },
}

impl FileHealth {
    fn inspect(path: &Path) -> Self {
        match read_slot(path) {
            Ok(None) => FileHealth::Missing,
            Ok(Some(contents)) => FileHealth::Valid {
                identity: contents.state.identity().to_string(),
                status: contents.state.status(),
                completed_units: contents.state.completed_count(),
                total_units: contents.state.total_units(),
            },
            Err(e) => FileHealth::Corrupt {
                reason: e.to_string(),
            },
        }
    }

    /// Whether this slot holds a usable record
    pub fn is_valid(&self) -> bool {
        matches!(self, FileHealth::Valid { .. })
    }
}

/// Health of both slots of one stored job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordHealth {
    /// File stem shared by the job's files
    pub stem: String,
    /// Primary slot
    pub primary: FileHealth,
    /// Backup slot
    pub backup: FileHealth,
}

impl RecordHealth {
    /// Whether `load` would find a usable record
    pub fn is_recoverable(&self) -> bool {
        self.primary.is_valid() || self.backup.is_valid()
    }
}

struct SlotContents {
    raw: String,
    state: JobState,
}

fn read_slot(path: &Path) -> Result<Option<SlotContents>, StoreError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(e.to_string())),
    };
    if metadata.len() > MAX_STATE_FILE_SIZE {
        return Err(StoreError::StateTooLarge {
            size: metadata.len(),
            max: MAX_STATE_FILE_SIZE,
        });
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            return Err(corrupt(path, "not valid UTF-8"))
        }
        Err(e) => return Err(StoreError::Io(e.to_string())),
    };
    let record: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| corrupt(path, e.to_string()))?;
    let state = JobState::from_record(record).map_err(|e| corrupt(path, e.to_string()))?;
    Ok(Some(SlotContents { raw, state }))
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Write `bytes` to `path` through a synced temporary file in `dir`
fn atomic_write(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| StoreError::Io(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(bytes)
        .map_err(|e| StoreError::Io(format!("Failed to write temp file: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| StoreError::Io(format!("Failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| StoreError::Io(format!("Failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| StoreError::Io(format!("Failed to persist {}: {e}", path.display())))?;

    // Make the rename durable
    if let Ok(dir) = std::fs::File::open(dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(format!("Failed to remove {}: {e}", path.display()))),
    }
}

/// Errors raised by the state store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Lock not acquired within the bounded wait
    #[error("state for {resource} is busy (waited {waited:?})")]
    Busy {
        /// Lock file that could not be acquired
        resource: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// Record cannot be parsed or validated
    #[error("corrupt state record {}: {reason}", .path.display())]
    Corrupt {
        /// Offending file
        path: PathBuf,
        /// Why the record was rejected
        reason: String,
    },

    /// State file exceeds the size limit
    #[error("state file too large: {size} bytes (max: {max} bytes)")]
    StateTooLarge {
        /// Actual size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// State rejected before writing
    #[error(transparent)]
    State(#[from] StateError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Lock error other than contention
    #[error("lock error: {0}")]
    Lock(String),
}

impl StoreError {
    /// Whether retrying the operation later may succeed
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy { .. })
    }
}
