//! Resumable execution of ordered work units
//!
//! The processor drives a [`WorkFunction`] over a list of [`WorkUnit`]s and
//! checkpoints a [`JobState`](crate::resume::JobState) after every unit, so an
//! interrupted job picks up where it stopped.
//!
//! # Overview
//!
//! 1. **Job**: identify the job with a [`JobSpec`] (identity, label, config fingerprint)
//! 2. **Execution**: run it with [`ResumableProcessor::run`]
//! 3. **Control**: pause, resume or stop from any task via [`ProcessorControl`]
//! 4. **Progress**: periodic `[PROGRESS]` logs plus an optional callback
//!
//! # Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use resumable_batch::processor::{JobSpec, ResumableProcessor, WorkFunction, WorkUnit};
//! use resumable_batch::resume::StateStore;
//! use std::sync::Arc;
//!
//! struct Line(usize, String);
//!
//! impl WorkUnit for Line {
//!     fn index(&self) -> usize {
//!         self.0
//!     }
//! }
//!
//! struct Upper;
//!
//! #[async_trait]
//! impl WorkFunction<Line> for Upper {
//!     type Output = String;
//!     type Error = std::io::Error;
//!
//!     async fn process(&self, unit: &Line) -> Result<String, std::io::Error> {
//!         Ok(unit.1.to_uppercase())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(StateStore::open(".processing")?);
//! let processor = ResumableProcessor::new(store);
//! let units = vec![Line(0, "a".into()), Line(1, "b".into())];
//!
//! let outcome = processor.run(&JobSpec::new("letters"), &units, &Upper).await?;
//! assert!(outcome.completed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod executor;
pub mod progress;
pub mod work;

pub use config::{FailurePolicy, MismatchPolicy, ProcessorConfig};
pub use control::{LoopState, ProcessorControl, SharedControl};
pub use executor::{JobSpec, ProcessOutcome, ProgressCallback, ResumableProcessor};
pub use progress::{ProgressState, ProgressTracker};
pub use work::{ErrorClass, UnitError, WorkFunction, WorkUnit};

use crate::identity::IdentityError;
use crate::resume::{StateError, StoreError};

/// Boxed error returned by a work function
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by [`ResumableProcessor::run`]
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// A unit failed fatally; the job was persisted as failed
    #[error("unit {index} failed: {source}")]
    UnitFatal {
        /// Index of the failing unit
        index: usize,
        /// Error reported by the work function
        source: BoxError,
    },

    /// Persisted state does not match the current run
    #[error("stored state for {identity} does not match this run: {reason}")]
    ConfigMismatch {
        /// Job identity
        identity: String,
        /// What differs
        reason: String,
    },

    /// Unit list is malformed
    #[error("invalid units: {0}")]
    InvalidUnits(String),

    /// Job identity is unusable
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// State store error
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Job state error, including illegal transitions
    #[error("job state error: {0}")]
    State(#[from] StateError),

    /// Result could not be converted to or from its record form
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Blocking store task panicked or was cancelled
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl ProcessorError {
    /// Unit index of a fatal unit failure
    pub fn unit_index(&self) -> Option<usize> {
        match self {
            ProcessorError::UnitFatal { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Whether the run may succeed if retried later
    pub fn is_busy(&self) -> bool {
        matches!(self, ProcessorError::Store(e) if e.is_busy())
    }
}
