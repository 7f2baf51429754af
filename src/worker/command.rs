//! Work function that pipes each unit through an external program

use super::TextUnit;
use crate::processor::{ErrorClass, WorkFunction};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit code treated as a transient failure unless overridden (`EX_TEMPFAIL`)
pub const DEFAULT_RECOVERABLE_EXIT_CODE: i32 = 75;

/// Longest stderr excerpt kept in an error message
const MAX_STDERR_LEN: usize = 512;

/// Errors from running the external program for one unit
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Program could not be started
    #[error("failed to start {program}: {reason}")]
    Spawn {
        /// Program name
        program: String,
        /// OS error
        reason: String,
    },

    /// Program ran longer than the unit timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Program exited unsuccessfully
    #[error("exited with {}: {stderr}", describe_exit(.code))]
    Exit {
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Start of the program's stderr
        stderr: String,
    },

    /// Piping to or from the program failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Program output is not UTF-8
    #[error("output is not valid UTF-8")]
    InvalidOutput,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_string(),
    }
}

/// Runs `program args...` once per unit, feeding the unit text on stdin and
/// taking stdout as the result.
///
/// The program also receives the unit index in the `UNIT_INDEX` environment
/// variable.
#[derive(Debug, Clone, Serialize)]
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    #[serde(skip)]
    recoverable_exit_codes: Vec<i32>,
    #[serde(skip)]
    unit_timeout: Option<Duration>,
}

impl CommandWorker {
    /// Create a worker for `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            recoverable_exit_codes: vec![DEFAULT_RECOVERABLE_EXIT_CODE],
            unit_timeout: None,
        }
    }

    /// Exit codes classified as recoverable
    pub fn with_recoverable_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.recoverable_exit_codes = codes;
        self
    }

    /// Kill the program and fail the unit recoverably after `timeout`
    pub fn with_unit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.unit_timeout = timeout;
        self
    }

    /// Program name
    pub fn program(&self) -> &str {
        &self.program
    }

    async fn execute(&self, unit: &TextUnit) -> Result<String, CommandError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("UNIT_INDEX", unit.index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CommandError::Io("stdin not captured".to_string()))?;
        let input = unit.text.clone();
        let writer = tokio::spawn(async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output();
        let output = match self.unit_timeout {
            Some(limit) => tokio::time::timeout(limit, output)
                .await
                .map_err(|_| CommandError::Timeout(limit))?,
            None => output.await,
        }
        .map_err(|e| CommandError::Io(e.to_string()))?;

        // A program that exits without reading its input closes the pipe early.
        match writer.await {
            Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => {
                return Err(CommandError::Io(format!("failed to write unit: {e}")))
            }
            Err(e) => return Err(CommandError::Io(e.to_string())),
            _ => {}
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_LEN).collect();
            return Err(CommandError::Exit {
                code: output.status.code(),
                stderr,
            });
        }

        String::from_utf8(output.stdout).map_err(|_| CommandError::InvalidOutput)
    }
}

#[async_trait]
impl WorkFunction<TextUnit> for CommandWorker {
    type Output = String;
    type Error = CommandError;

    async fn process(&self, unit: &TextUnit) -> Result<String, CommandError> {
        debug!(index = unit.index, program = %self.program, "Running unit command");
        let output = self.execute(unit).await?;
        Ok(output.trim_end_matches('\n').to_string())
    }

    fn classify(&self, error: &CommandError) -> ErrorClass {
        match error {
            CommandError::Timeout(_) => ErrorClass::Recoverable,
            CommandError::Exit { code: Some(code), .. }
                if self.recoverable_exit_codes.contains(code) =>
            {
                ErrorClass::Recoverable
            }
            _ => ErrorClass::Fatal,
        }
    }
}
