//! # Resumable Batch Library
//!
//! Checkpointed, pausable, crash-safe execution of long batch jobs made of
//! independent, ordered work units, such as text chunks sent one by one to a
//! rate-limited remote service.
//!
//! ## Features
//!
//! - **Checkpointing**: job state is persisted after every unit, so an interrupted job
//!   resumes without redoing or duplicating completed work
//! - **Crash Consistency**: atomic writes, a backup record and advisory locks with a
//!   bounded wait
//! - **Cooperative Control**: pause, resume and stop a running job from any task
//! - **Failure Classification**: recoverable unit failures are recorded and skipped,
//!   fatal ones stop the job and leave it on disk as failed
//! - **Drift Detection**: a configuration fingerprint prevents resuming a job with
//!   different settings
//!
//! ## Quick Start
//!
//! ```no_run
//! use resumable_batch::processor::ResumableProcessor;
//! use resumable_batch::resume::StateStore;
//! use resumable_batch::worker::{split_units, CommandWorker};
//! use resumable_batch::JobSpec;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let units = split_units("first paragraph\n\nsecond paragraph\n");
//! let worker = CommandWorker::new("tr", vec!["a-z".into(), "A-Z".into()]);
//! let job = JobSpec::new("paragraphs").with_config(&worker)?;
//!
//! let store = Arc::new(StateStore::open(".processing")?);
//! let processor = ResumableProcessor::new(store);
//! let control = processor.control(); // pause/resume/stop from elsewhere
//!
//! let outcome = processor.run(&job, &units, &worker).await?;
//! if outcome.completed {
//!     println!("{}", outcome.results.join("\n\n"));
//! }
//! # drop(control);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`identity`] - Job identities, configuration fingerprints and file stems
//! - [`resume`] - Job state record and its crash-consistent store
//! - [`processor`] - The resumable execution loop, its control surface and progress
//! - [`worker`] - Input splitting and the external command work function
//! - [`metrics`] - Prometheus metrics
//! - [`cli`] - Command-line interface

#![warn(missing_docs)]
#![warn(clippy::all)]

/// CLI command implementations
pub mod cli;

/// Job identities and fingerprints
pub mod identity;

/// Metrics collection
pub mod metrics;

/// Resumable execution loop
pub mod processor;

/// Job state persistence
pub mod resume;

/// Work functions shipped with the CLI
pub mod worker;

pub use identity::{derive_identity, fingerprint};
pub use processor::{
    ErrorClass, JobSpec, ProcessOutcome, ProcessorControl, ProcessorError, ResumableProcessor,
    WorkFunction, WorkUnit,
};
pub use resume::{JobState, JobStatus, StateStore, StoreError};
