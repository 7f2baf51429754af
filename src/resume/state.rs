//! Job state record and schema handling
//!
//! A [`JobState`] is the durable progress record of one job: which units are
//! done, their serialized results, recoverable failures, and the lifecycle
//! status. Records carry a schema version; the previous on-disk layout
//! (`"1.0"`) is migrated on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, info};

/// Current job state schema version
pub const SCHEMA_VERSION: &str = "2.0";

/// Previous schema version that can be migrated
pub const LEGACY_SCHEMA_VERSION: &str = "1.0";

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not started
    #[default]
    Idle,
    /// Units are being processed
    Running,
    /// Interrupted by a pause or stop request
    Paused,
    /// Every unit has been processed
    Completed,
    /// Aborted by a fatal unit error
    Failed,
}

impl JobStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Running -> Running` is accepted so a record left behind by a crashed
    /// run can be picked up again.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Failed)
                | (Running, Completed)
        )
    }

    /// Lowercase name used in records and summaries
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage totals reported by the work function for processed units
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Input units consumed (tokens, bytes, ...)
    #[serde(default)]
    pub input_tokens: u64,
    /// Output units produced
    #[serde(default)]
    pub output_tokens: u64,
    /// Cost in caller-defined currency
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    /// Add another usage report to this total
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cost += other.cost;
    }
}

/// Durable progress record for a single job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    schema_version: String,
    identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default)]
    status: JobStatus,
    total_units: usize,
    #[serde(default, serialize_with = "serialize_sorted")]
    completed_unit_ids: HashSet<usize>,
    #[serde(default)]
    unit_results: BTreeMap<usize, Value>,
    #[serde(default)]
    failed_units: BTreeMap<usize, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fatal_error: Option<String>,
    #[serde(default)]
    usage: Usage,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
}

fn serialize_sorted<S: Serializer>(ids: &HashSet<usize>, serializer: S) -> Result<S::Ok, S::Error> {
    let mut sorted: Vec<usize> = ids.iter().copied().collect();
    sorted.sort_unstable();
    sorted.serialize(serializer)
}

impl JobState {
    /// Create a fresh, idle job state
    pub fn new(identity: impl Into<String>, total_units: usize) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            identity: identity.into(),
            label: None,
            status: JobStatus::Idle,
            total_units,
            completed_unit_ids: HashSet::new(),
            unit_results: BTreeMap::new(),
            failed_units: BTreeMap::new(),
            config_fingerprint: None,
            fatal_error: None,
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a human-readable label
    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    /// Attach the configuration fingerprint of the run that owns this job
    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.config_fingerprint = fingerprint;
        self
    }

    /// Get the schema version
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Get the job identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Get the label
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Get the lifecycle status
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Get the expected unit count
    pub fn total_units(&self) -> usize {
        self.total_units
    }

    /// Get the set of completed unit indices
    pub fn completed_unit_ids(&self) -> &HashSet<usize> {
        &self.completed_unit_ids
    }

    /// Whether the unit at `index` has been completed
    pub fn is_unit_completed(&self, index: usize) -> bool {
        self.completed_unit_ids.contains(&index)
    }

    /// Number of completed units
    pub fn completed_count(&self) -> usize {
        self.completed_unit_ids.len()
    }

    /// Serialized results keyed by unit index
    pub fn unit_results(&self) -> &BTreeMap<usize, Value> {
        &self.unit_results
    }

    /// Recoverable failures keyed by unit index
    pub fn failed_units(&self) -> &BTreeMap<usize, String> {
        &self.failed_units
    }

    /// Get the configuration fingerprint
    pub fn config_fingerprint(&self) -> Option<&str> {
        self.config_fingerprint.as_deref()
    }

    /// Error that moved the job to [`JobStatus::Failed`], if any
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    /// Accumulated usage reported by the work function
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Creation timestamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last update timestamp
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether a later run can pick this job up where it stopped
    pub fn is_resumable(&self) -> bool {
        matches!(self.status, JobStatus::Running | JobStatus::Paused)
            && self.completed_unit_ids.iter().all(|&id| id < self.total_units)
            && self.completed_unit_ids.len() < self.total_units
    }

    /// Smallest unit index not yet completed, or `total_units`.
    ///
    /// Only a hint: skipped failures can leave gaps before later completions.
    pub fn next_unit_index(&self) -> usize {
        (0..self.total_units)
            .find(|id| !self.completed_unit_ids.contains(id))
            .unwrap_or(self.total_units)
    }

    /// Unit indices that are neither completed nor recorded as failed
    pub fn remaining_units(&self) -> Vec<usize> {
        (0..self.total_units)
            .filter(|id| !self.completed_unit_ids.contains(id) && !self.failed_units.contains_key(id))
            .collect()
    }

    /// Whether every index in `[0, total_units)` has been completed
    pub fn covers_all_units(&self) -> bool {
        (0..self.total_units).all(|id| self.completed_unit_ids.contains(&id))
    }

    /// Completion percentage (0-100)
    pub fn progress_percentage(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        (self.completed_unit_ids.len() as f64 / self.total_units as f64) * 100.0
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: JobStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == JobStatus::Completed && !self.covers_all_units() {
            return Err(StateError::Invalid(format!(
                "cannot complete job with {}/{} units done",
                self.completed_unit_ids.len(),
                self.total_units
            )));
        }
        debug!(identity = %self.identity, from = %self.status, to = %next, "Job status transition");
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Record a successful unit. Clears any earlier failure for the same index.
    pub fn record_success(&mut self, index: usize, result: Value, usage: Option<&Usage>) {
        self.completed_unit_ids.insert(index);
        self.unit_results.insert(index, result);
        self.failed_units.remove(&index);
        if let Some(usage) = usage {
            self.usage.accumulate(usage);
        }
        self.touch();
    }

    /// Record a recoverable unit failure
    pub fn record_failure(&mut self, index: usize, message: impl Into<String>) {
        self.failed_units.insert(index, message.into());
        self.touch();
    }

    /// Mark the job failed with the fatal error that aborted it
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), StateError> {
        self.transition(JobStatus::Failed)?;
        self.fatal_error = Some(message.into());
        Ok(())
    }

    /// Refresh the update timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Check internal invariants of a loaded record
    pub fn validate(&self) -> Result<(), StateError> {
        if self.identity.trim().is_empty() {
            return Err(StateError::Invalid("identity cannot be empty".to_string()));
        }
        if let Some(id) = self.completed_unit_ids.iter().find(|&&id| id >= self.total_units) {
            return Err(StateError::Invalid(format!(
                "completed unit {id} outside of 0..{}",
                self.total_units
            )));
        }
        if self.status == JobStatus::Completed && !self.covers_all_units() {
            return Err(StateError::Invalid(format!(
                "completed job covers {}/{} units",
                self.completed_unit_ids.len(),
                self.total_units
            )));
        }
        if self.completed_unit_ids.len() != self.unit_results.len()
            || !self.unit_results.keys().all(|id| self.completed_unit_ids.contains(id))
        {
            return Err(StateError::Invalid(format!(
                "{} completed units but {} results",
                self.completed_unit_ids.len(),
                self.unit_results.len()
            )));
        }
        Ok(())
    }

    /// Convert to a serialization-neutral record
    pub fn to_record(&self) -> Result<Value, StateError> {
        serde_json::to_value(self).map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Rebuild a job state from a record, migrating older schemas
    pub fn from_record(record: Value) -> Result<Self, StateError> {
        let version = record
            .get("schema_version")
            .or_else(|| record.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let state = match version.as_deref() {
            Some(SCHEMA_VERSION) => serde_json::from_value::<JobState>(record)
                .map_err(|e| StateError::Deserialization(e.to_string()))?,
            Some(LEGACY_SCHEMA_VERSION) => {
                let legacy = serde_json::from_value::<LegacyRecord>(record)
                    .map_err(|e| StateError::Deserialization(e.to_string()))?;
                legacy.migrate()?
            }
            other => {
                return Err(StateError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION.to_string(),
                    found: other.unwrap_or("<missing>").to_string(),
                })
            }
        };

        state.validate()?;
        Ok(state)
    }

    /// Display summary of this job
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            identity: self.identity.clone(),
            label: self.label.clone(),
            status: self.status,
            completed_units: self.completed_unit_ids.len(),
            total_units: self.total_units,
            progress_pct: self.progress_percentage(),
            failed_units: self.failed_units.len(),
            fatal_error: self.fatal_error.clone(),
            usage: self.usage.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Condensed view of a job for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    /// Job identity
    pub identity: String,
    /// Human-readable label
    pub label: Option<String>,
    /// Lifecycle status
    pub status: JobStatus,
    /// Number of completed units
    pub completed_units: usize,
    /// Expected unit count
    pub total_units: usize,
    /// Completion percentage (0-100)
    pub progress_pct: f64,
    /// Number of units with recorded recoverable failures
    pub failed_units: usize,
    /// Fatal error for failed jobs
    pub fatal_error: Option<String>,
    /// Accumulated usage
    pub usage: Usage,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Record layout written by schema version 1.0
#[derive(Debug, Deserialize)]
struct LegacyRecord {
    #[serde(default)]
    file_id: String,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    video_title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    started_at: String,
    #[serde(default)]
    last_updated: String,
    #[serde(default)]
    config: serde_json::Map<String, Value>,
    #[serde(default)]
    total_chunks: usize,
    #[serde(default)]
    completed_chunks: Vec<usize>,
    #[serde(default)]
    failed_chunks: BTreeMap<String, String>,
    #[serde(default)]
    processed_results: Vec<Value>,
    #[serde(default)]
    actual_cost: f64,
    #[serde(default)]
    total_input_tokens: u64,
    #[serde(default)]
    total_output_tokens: u64,
}

impl LegacyRecord {
    fn migrate(self) -> Result<JobState, StateError> {
        let status = match self.status.as_str() {
            "" | "idle" => JobStatus::Idle,
            "processing" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "crashed" => JobStatus::Failed,
            other => {
                return Err(StateError::Invalid(format!("unknown legacy status: {other}")));
            }
        };

        let mut unit_results = BTreeMap::new();
        for result in self.processed_results {
            let index = result
                .get("chunk_index")
                .and_then(Value::as_u64)
                .ok_or_else(|| StateError::Invalid("legacy result without chunk_index".to_string()))?;
            unit_results.insert(index as usize, result);
        }

        // Legacy writers could record a completion without caching its result.
        let completed_unit_ids: HashSet<usize> = self
            .completed_chunks
            .into_iter()
            .filter(|id| unit_results.contains_key(id))
            .collect();
        unit_results.retain(|id, _| completed_unit_ids.contains(id));

        let mut failed_units = BTreeMap::new();
        for (key, message) in self.failed_chunks {
            let index = key
                .parse::<usize>()
                .map_err(|_| StateError::Invalid(format!("legacy failed chunk key: {key}")))?;
            failed_units.insert(index, message);
        }

        let config_fingerprint = if self.config.is_empty() {
            None
        } else {
            Some(
                crate::identity::fingerprint(&self.config)
                    .map_err(|e| StateError::Serialization(e.to_string()))?,
            )
        };

        let label = [self.video_title, self.file_name]
            .into_iter()
            .find(|s| !s.is_empty());

        let now = Utc::now();
        let state = JobState {
            schema_version: SCHEMA_VERSION.to_string(),
            identity: self.file_id,
            label,
            status,
            total_units: self.total_chunks,
            completed_unit_ids,
            unit_results,
            failed_units,
            config_fingerprint,
            fatal_error: None,
            usage: Usage {
                input_tokens: self.total_input_tokens,
                output_tokens: self.total_output_tokens,
                cost: self.actual_cost,
            },
            created_at: parse_legacy_timestamp(&self.started_at).unwrap_or(now),
            updated_at: parse_legacy_timestamp(&self.last_updated).unwrap_or(now),
        };

        info!(
            identity = %state.identity,
            old_version = LEGACY_SCHEMA_VERSION,
            new_version = SCHEMA_VERSION,
            completed = state.completed_unit_ids.len(),
            "Migrated job state schema"
        );
        Ok(state)
    }
}

fn parse_legacy_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Errors related to job state records
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// Illegal status transition
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },

    /// Record violates a state invariant
    #[error("invalid job state: {0}")]
    Invalid(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
