//! Status, discard and verify commands

use super::{blocking, Cli, CliError, OutputFormat};
use crate::resume::{FileHealth, JobSummary, RecordHealth};
use crate::worker::source_identity;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

/// Arguments of the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Show only this job
    #[arg(long)]
    pub identity: Option<String>,
}

impl StatusArgs {
    /// Execute the status command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = cli.open_store()?;
        let dir = store.dir().to_path_buf();
        let identity = self.identity.clone();
        let jobs: Vec<JobSummary> = blocking(move || match identity {
            Some(identity) => Ok(store.summary(&identity).into_iter().collect()),
            None => Ok(store.list_jobs()?),
        })
        .await?;

        match cli.output_format {
            OutputFormat::Json => print_json(&jobs),
            OutputFormat::Human => {
                if jobs.is_empty() {
                    println!("No jobs in {}", dir.display());
                }
                for job in &jobs {
                    print_summary(job);
                }
                Ok(())
            }
        }
    }
}

fn print_summary(job: &JobSummary) {
    match &job.label {
        Some(label) => println!("{} ({label})", job.identity),
        None => println!("{}", job.identity),
    }
    println!("  Status: {}", job.status);
    println!(
        "  Progress: {}/{} units ({:.1}%)",
        job.completed_units, job.total_units, job.progress_pct
    );
    if job.failed_units > 0 {
        println!("  Failed units: {}", job.failed_units);
    }
    if let Some(error) = &job.fatal_error {
        println!("  Error: {error}");
    }
    if job.usage.input_tokens > 0 || job.usage.output_tokens > 0 || job.usage.cost > 0.0 {
        println!(
            "  Usage: {} in / {} out, cost {:.4}",
            job.usage.input_tokens, job.usage.output_tokens, job.usage.cost
        );
    }
    println!("  Updated: {}", job.updated_at.to_rfc3339());
}

/// Arguments of the discard command
#[derive(Parser, Debug)]
pub struct DiscardArgs {
    /// Job identity to discard
    #[arg(long, conflicts_with = "input", required_unless_present = "input")]
    pub identity: Option<String>,

    /// Discard the job of this input file
    #[arg(long)]
    pub input: Option<PathBuf>,
}

impl DiscardArgs {
    /// Execute the discard command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let identity = match (&self.identity, &self.input) {
            (Some(identity), _) => identity.clone(),
            (None, Some(input)) => source_identity(input).map_err(|e| {
                CliError::IoError(format!("Failed to stat {}: {e}", input.display()))
            })?,
            (None, None) => {
                return Err(CliError::InvalidArgument(
                    "either --identity or --input is required".to_string(),
                ))
            }
        };

        let store = cli.open_store()?;
        {
            let identity = identity.clone();
            blocking(move || Ok(store.clear(&identity)?)).await?;
        }
        info!(identity = %identity, "Discarded job state");

        match cli.output_format {
            OutputFormat::Json => print_json(&serde_json::json!({
                "discarded": identity,
            })),
            OutputFormat::Human => {
                println!("Discarded state for job {identity}");
                Ok(())
            }
        }
    }
}

/// Arguments of the verify command
#[derive(Parser, Debug)]
pub struct VerifyArgs {}

impl VerifyArgs {
    /// Execute the verify command. Fails when a job has no usable record.
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = cli.open_store()?;
        let dir = store.dir().to_path_buf();
        let report = blocking(move || Ok(store.verify()?)).await?;
        let unrecoverable = report.iter().filter(|r| !r.is_recoverable()).count();

        match cli.output_format {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Human => {
                if report.is_empty() {
                    println!("No job records in {}", dir.display());
                }
                for record in &report {
                    print_health(record);
                }
            }
        }

        if unrecoverable > 0 {
            return Err(CliError::VerifyFailed(unrecoverable));
        }
        Ok(())
    }
}

fn print_health(record: &RecordHealth) {
    let verdict = if record.is_recoverable() { "ok" } else { "UNRECOVERABLE" };
    println!("{} [{verdict}]", record.stem);
    println!("  primary: {}", describe(&record.primary));
    println!("  backup:  {}", describe(&record.backup));
}

fn describe(health: &FileHealth) -> String {
    match health {
        FileHealth::Missing => "missing".to_string(),
        FileHealth::Valid {
            identity,
            status,
            completed_units,
            total_units,
        } => format!("valid ({identity}, {status}, {completed_units}/{total_units} units)"),
        FileHealth::Corrupt { reason } => format!("corrupt ({reason})"),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string(value)
        .map_err(|e| CliError::IoError(format!("Failed to encode output: {e}")))?;
    println!("{text}");
    Ok(())
}
