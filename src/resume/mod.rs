//! Durable job state
//!
//! [`JobState`] is the progress record of one job; [`StateStore`] persists it
//! with atomic writes, a backup slot and per-identity advisory locks.

pub mod lock;
pub mod state;
pub mod store;

pub use lock::StateLock;
pub use state::{JobState, JobStatus, JobSummary, StateError, Usage, SCHEMA_VERSION};
pub use store::{FileHealth, RecordHealth, StateStore, StoreError};
