//! Run command: process an input file through an external program

use super::{blocking, Cli, CliError, OutputFormat};
use crate::processor::{
    FailurePolicy, JobSpec, LoopState, MismatchPolicy, ProcessOutcome, ProcessorConfig,
    ResumableProcessor, SharedControl,
};
use crate::worker::{source_identity, split_units, CommandWorker, DEFAULT_RECOVERABLE_EXIT_CODE};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Arguments of the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input file; blank lines separate units
    #[arg(long)]
    pub input: PathBuf,

    /// Write results here instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Job identity (default: derived from the input file name and size)
    #[arg(long)]
    pub identity: Option<String>,

    /// Failure policy: continue or fail-fast
    #[arg(long, default_value = "continue")]
    pub failure_policy: FailurePolicy,

    /// When stored state was written with a different command: restart or fail
    #[arg(long, default_value = "restart")]
    pub on_config_mismatch: MismatchPolicy,

    /// Discard any existing state for this input before running
    #[arg(long, default_value_t = false)]
    pub fresh: bool,

    /// Per-unit time limit in seconds; a timed-out unit fails recoverably
    #[arg(long)]
    pub unit_timeout_secs: Option<u64>,

    /// Exit code of the program that marks a recoverable failure (repeatable)
    #[arg(long, default_values_t = [DEFAULT_RECOVERABLE_EXIT_CODE])]
    pub recoverable_exit_code: Vec<i32>,

    /// Program and arguments run for every unit, after `--`
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Execute the run command
    pub async fn execute(&self, cli: &Cli, control: SharedControl) -> Result<(), CliError> {
        let text = tokio::fs::read_to_string(&self.input).await.map_err(|e| {
            CliError::IoError(format!("Failed to read {}: {e}", self.input.display()))
        })?;
        let units = split_units(&text);

        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => source_identity(&self.input).map_err(|e| {
                CliError::IoError(format!("Failed to stat {}: {e}", self.input.display()))
            })?,
        };

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| CliError::InvalidArgument("missing program to run".to_string()))?;
        let worker = CommandWorker::new(program.clone(), args.to_vec())
            .with_recoverable_exit_codes(self.recoverable_exit_code.clone())
            .with_unit_timeout(self.unit_timeout_secs.map(Duration::from_secs));

        let job = JobSpec::new(identity.clone())
            .with_label(input_label(&self.input))
            .with_config(&worker)?;

        let store = Arc::new(cli.open_store()?);
        if self.fresh {
            let (store, stale) = (Arc::clone(&store), identity.clone());
            blocking(move || Ok(store.clear(&stale)?)).await?;
            info!(identity = %identity, "Discarded existing state (--fresh)");
        }

        let config = ProcessorConfig::new()
            .with_failure_policy(self.failure_policy)
            .with_mismatch_policy(self.on_config_mismatch);

        let progress = create_progress_bar(units.len(), cli.output_format);
        let processor = ResumableProcessor::new(store)
            .with_control(control)
            .with_config(config)
            .with_progress_callback({
                let progress = progress.clone();
                move |completed, total, state| {
                    progress.set_length(total as u64);
                    progress.set_position(completed as u64);
                    progress.set_message(state.to_string());
                }
            });

        info!(
            identity = %identity,
            units = units.len(),
            program = %program,
            "Starting run"
        );
        let result = processor.run(&job, &units, &worker).await;
        progress.finish_and_clear();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if cli.output_format == OutputFormat::Json {
                    let output = serde_json::json!({
                        "success": false,
                        "identity": identity,
                        "error": e.to_string(),
                    });
                    println!("{output}");
                }
                return Err(e.into());
            }
        };

        let total = units.len();
        // Partial results too: the job's state is already cleared
        if outcome.completed {
            if let Some(path) = &self.output {
                write_results(path, &outcome.results).await?;
            }
        }

        match cli.output_format {
            OutputFormat::Json => output_json(&identity, total, self.output.as_deref(), &outcome),
            OutputFormat::Human => output_human(&identity, total, self.output.as_deref(), &outcome),
        }

        if outcome.completed && !outcome.failed_units.is_empty() {
            return Err(CliError::UnitsFailed {
                failed: outcome.failed_units.len(),
                total,
            });
        }
        Ok(())
    }
}

fn input_label(input: &Path) -> String {
    input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.display().to_string())
}

async fn write_results(path: &Path, results: &[String]) -> Result<(), CliError> {
    let mut contents = results.join("\n\n");
    contents.push('\n');
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| CliError::IoError(format!("Failed to write {}: {e}", path.display())))
}

fn create_progress_bar(total: usize, format: OutputFormat) -> ProgressBar {
    if format == OutputFormat::Json {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .expect("hardcoded template is valid")
            .progress_chars("#>-"),
    );
    pb.set_message(LoopState::Idle.to_string());
    pb
}

fn output_json(
    identity: &str,
    total: usize,
    output_path: Option<&Path>,
    outcome: &ProcessOutcome<String>,
) {
    let mut output = serde_json::json!({
        "success": outcome.completed && outcome.failed_units.is_empty(),
        "identity": identity,
        "completed": outcome.completed,
        "total_units": total,
        "processed_units": outcome.results.len(),
        "failed_units": outcome.failed_units,
    });
    match output_path {
        Some(path) => output["output_path"] = serde_json::Value::String(path.display().to_string()),
        None if outcome.completed => output["results"] = serde_json::json!(outcome.results),
        None => {}
    }
    println!("{output}");
}

fn output_human(
    identity: &str,
    total: usize,
    output_path: Option<&Path>,
    outcome: &ProcessOutcome<String>,
) {
    if !outcome.completed {
        eprintln!(
            "\nRun stopped after {}/{} units. Progress saved for job {identity}; run the same command again to resume.",
            outcome.results.len(),
            total
        );
        return;
    }

    for (index, error) in &outcome.failed_units {
        warn!(index, error = %error, "Unit failed");
    }

    if outcome.failed_units.is_empty() {
        eprintln!("\nRun completed successfully!");
    } else {
        let indices: Vec<String> = outcome.failed_units.keys().map(|i| i.to_string()).collect();
        eprintln!("\nRun finished with failures!");
        eprintln!(
            "Failed units: {} (indices: {})",
            outcome.failed_units.len(),
            indices.join(", ")
        );
    }
    eprintln!("Job: {identity}");
    eprintln!("Units processed: {}/{}", outcome.results.len(), total);

    match output_path {
        Some(path) if outcome.failed_units.is_empty() => eprintln!("Output: {}", path.display()),
        Some(path) => eprintln!(
            "Output: {} (partial, failed units omitted)",
            path.display()
        ),
        None => {
            for result in &outcome.results {
                println!("{result}\n");
            }
        }
    }
}
