//! Processor configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Minimum interval between periodic progress logs.
/// Also emitted on every 10% step, so short jobs still report.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Percentage step that forces a progress log
pub const DEFAULT_PROGRESS_STEP: f64 = 10.0;

/// What to do when a unit fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Recoverable failures are recorded and the job continues
    #[default]
    ContinueOnRecoverable,
    /// Every failure is fatal
    FailFast,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(FailurePolicy::ContinueOnRecoverable),
            "fail-fast" | "fail_fast" => Ok(FailurePolicy::FailFast),
            _ => Err(format!(
                "invalid failure policy: '{s}' (expected 'continue' or 'fail-fast')"
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::ContinueOnRecoverable => f.write_str("continue"),
            FailurePolicy::FailFast => f.write_str("fail-fast"),
        }
    }
}

/// What to do when a resumable record was written by a different configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Discard the stale record and start over
    #[default]
    StartFresh,
    /// Refuse to run
    Fail,
}

impl FromStr for MismatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "restart" => Ok(MismatchPolicy::StartFresh),
            "fail" => Ok(MismatchPolicy::Fail),
            _ => Err(format!(
                "invalid mismatch policy: '{s}' (expected 'restart' or 'fail')"
            )),
        }
    }
}

impl fmt::Display for MismatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchPolicy::StartFresh => f.write_str("restart"),
            MismatchPolicy::Fail => f.write_str("fail"),
        }
    }
}

/// Settings for a [`ResumableProcessor`](super::ResumableProcessor)
#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    /// Failure handling
    pub failure_policy: FailurePolicy,
    /// Fingerprint drift handling
    pub mismatch_policy: MismatchPolicy,
}

impl ProcessorConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the mismatch policy
    pub fn with_mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.mismatch_policy = policy;
        self
    }
}
