//! Work unit and work function traits

use crate::resume::Usage;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An item of work with a stable position in its job
pub trait WorkUnit {
    /// Zero-based index of this unit, stable across runs
    fn index(&self) -> usize;
}

impl<T: WorkUnit + ?Sized> WorkUnit for &T {
    fn index(&self) -> usize {
        (**self).index()
    }
}

/// How a failed unit affects the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Record the failure and continue with the next unit
    Recoverable,
    /// Stop the job and mark it failed
    Fatal,
}

/// The transformation applied to every unit.
///
/// Outputs are checkpointed as JSON, so they must round-trip through serde.
/// Retry and backoff for transient errors belong inside [`process`](Self::process).
#[async_trait]
pub trait WorkFunction<U: WorkUnit + Sync>: Send + Sync {
    /// Result of one unit
    type Output: Serialize + DeserializeOwned + Send + Sync;
    /// Error of one unit
    type Error: std::error::Error + Send + Sync + 'static;

    /// Process a single unit
    async fn process(&self, unit: &U) -> Result<Self::Output, Self::Error>;

    /// Classify a unit error. Unclassified errors are fatal.
    fn classify(&self, _error: &Self::Error) -> ErrorClass {
        ErrorClass::Fatal
    }

    /// Usage to add to the job totals for a successful unit
    fn usage(&self, _output: &Self::Output) -> Option<Usage> {
        None
    }
}

/// Ready-made error type for work functions that classify at the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "class", content = "message", rename_all = "snake_case")]
pub enum UnitError {
    /// Transient failure, the unit can be retried later
    #[error("recoverable: {0}")]
    Recoverable(String),
    /// Permanent failure
    #[error("fatal: {0}")]
    Fatal(String),
}

impl UnitError {
    /// Classification carried by this error
    pub fn class(&self) -> ErrorClass {
        match self {
            UnitError::Recoverable(_) => ErrorClass::Recoverable,
            UnitError::Fatal(_) => ErrorClass::Fatal,
        }
    }
}
