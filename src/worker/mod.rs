//! Text input splitting and the external command work function
//!
//! The CLI treats an input file as a list of blank-line separated text units
//! and pipes each one through an external program.

pub mod command;

pub use command::{CommandError, CommandWorker, DEFAULT_RECOVERABLE_EXIT_CODE};

use crate::identity::derive_identity;
use crate::processor::WorkUnit;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A block of text with its position in the input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextUnit {
    /// Zero-based position in the input
    pub index: usize,
    /// Unit text, trimmed
    pub text: String,
}

impl WorkUnit for TextUnit {
    fn index(&self) -> usize {
        self.index
    }
}

/// Split `input` into units separated by one or more blank lines.
///
/// # Examples
///
/// ```
/// use resumable_batch::worker::split_units;
///
/// let units = split_units("first\nline\n\n\nsecond\n");
/// assert_eq!(units.len(), 2);
/// assert_eq!(units[0].text, "first\nline");
/// assert_eq!(units[1].index, 1);
/// ```
pub fn split_units(input: &str) -> Vec<TextUnit> {
    let mut units = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in input.lines() {
        if line.trim().is_empty() {
            push_unit(&mut units, &mut current);
        } else {
            current.push(line.trim_end());
        }
    }
    push_unit(&mut units, &mut current);
    units
}

fn push_unit(units: &mut Vec<TextUnit>, current: &mut Vec<&str>) {
    if current.is_empty() {
        return;
    }
    units.push(TextUnit {
        index: units.len(),
        text: current.join("\n"),
    });
    current.clear();
}

/// Identity of an input file, from its file name and size
pub fn source_identity(path: &Path) -> std::io::Result<String> {
    let size = std::fs::metadata(path)?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(derive_identity(&name, size))
}
