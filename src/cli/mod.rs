//! CLI command implementations

pub mod error;
pub mod run;
pub mod status;

pub use error::CliError;
pub use run::RunArgs;
pub use status::{DiscardArgs, StatusArgs, VerifyArgs};

use crate::resume::StateStore;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default directory holding job state
pub const DEFAULT_STATE_DIR: &str = ".processing";

/// Resumable batch processor CLI
#[derive(Parser, Debug)]
#[command(name = "resumable-batch")]
#[command(about = "Run checkpointed, pausable batch jobs over text units", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Job state directory
    #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Seconds to wait for a job's state lock before giving up (range: 0-3600)
    #[arg(long, global = true, default_value = "10", value_parser = clap::value_parser!(u64).range(0..=3600))]
    pub lock_timeout_secs: u64,

    /// Serve Prometheus metrics on this address (e.g., 127.0.0.1:9090)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Open the state store configured by the global flags
    pub fn open_store(&self) -> Result<StateStore, CliError> {
        Ok(StateStore::open(&self.state_dir)?
            .with_lock_timeout(Duration::from_secs(self.lock_timeout_secs)))
    }
}

/// Run blocking state store work on the blocking pool.
///
/// Store calls may sleep while polling for a lock, so commands never run them
/// on the async runtime directly.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, CliError>
where
    F: FnOnce() -> Result<T, CliError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CliError::TaskJoin(e.to_string()))?
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process an input file, resuming an interrupted run of the same input
    Run(RunArgs),
    /// Show persisted jobs
    Status(StatusArgs),
    /// Delete a job's persisted state
    Discard(DiscardArgs),
    /// Check primary and backup records in the state directory
    Verify(VerifyArgs),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}
