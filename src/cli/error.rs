//! CLI error types and conversions

use crate::identity::IdentityError;
use crate::processor::ProcessorError;
use crate::resume::StoreError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Processing error
    #[error("processing error: {0}")]
    ProcessorError(#[from] ProcessorError),

    /// State store error
    #[error("state store error: {0}")]
    StoreError(#[from] StoreError),

    /// Identity error
    #[error("identity error: {0}")]
    IdentityError(#[from] IdentityError),

    /// Input or output file error
    #[error("I/O error: {0}")]
    IoError(String),

    /// Job finished with units that could not be processed
    #[error("{failed} of {total} units failed")]
    UnitsFailed {
        /// Failed unit count
        failed: usize,
        /// Total unit count
        total: usize,
    },

    /// State directory holds records that cannot be recovered
    #[error("verify failed: {0} unrecoverable job record(s)")]
    VerifyFailed(usize),

    /// Blocking store task panicked or was cancelled
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
