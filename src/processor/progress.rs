//! Progress tracking for long-running jobs.
//!
//! Computes completion percentage, throughput and remaining time, and formats
//! the periodic `[PROGRESS]` lines logged by the processor.

use super::config::{DEFAULT_PROGRESS_INTERVAL, DEFAULT_PROGRESS_STEP};
use std::time::{Duration, Instant};

/// Controls how often progress is reported.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    update_interval: Duration,
    min_percentage_step: f64,
}

impl ProgressTracker {
    /// Create a tracker with custom interval and percentage step.
    pub fn new(update_interval: Duration, min_percentage_step: f64) -> Self {
        Self {
            update_interval,
            min_percentage_step,
        }
    }

    /// Build a [`ProgressState`] for a job that already has `already_done` units.
    pub fn create_state(&self, total: usize, already_done: usize) -> ProgressState {
        let mut state = ProgressState::new(total, already_done);
        state.update_interval = self.update_interval;
        state.min_percentage_step = self.min_percentage_step;
        state
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL, DEFAULT_PROGRESS_STEP)
    }
}

/// Progress of one run.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Units completed, including those restored from a checkpoint.
    pub units_done: usize,
    /// Units completed before this run started.
    pub resumed_from: usize,
    /// Units that failed recoverably in this run.
    pub units_failed: usize,
    /// Total units in the job.
    pub total: usize,
    /// When this run started.
    pub start_time: Instant,
    /// Last time progress was reported.
    pub last_update: Instant,
    /// Minimum interval between reports.
    pub update_interval: Duration,
    /// Units per second in this run.
    pub current_rate: f64,
    /// Last reported percentage.
    pub last_reported_percentage: f64,
    /// Percentage delta that forces a report.
    pub min_percentage_step: f64,
}

impl ProgressState {
    /// Create progress for `total` units of which `already_done` are complete.
    pub fn new(total: usize, already_done: usize) -> Self {
        let now = Instant::now();
        let initial_pct = percentage_of(already_done, total);
        Self {
            units_done: already_done,
            resumed_from: already_done,
            units_failed: 0,
            total,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_PROGRESS_INTERVAL,
            current_rate: 0.0,
            last_reported_percentage: initial_pct,
            min_percentage_step: DEFAULT_PROGRESS_STEP,
        }
    }

    /// Count a completed unit.
    pub fn record_success(&mut self) {
        self.units_done = self.units_done.saturating_add(1);
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current_rate = self.processed_this_run() as f64 / elapsed;
        }
    }

    /// Count a recoverable failure.
    pub fn record_failure(&mut self) {
        self.units_failed = self.units_failed.saturating_add(1);
    }

    /// Units completed by this run.
    pub fn processed_this_run(&self) -> usize {
        self.units_done.saturating_sub(self.resumed_from)
    }

    /// Completion percentage (0-100).
    pub fn percentage(&self) -> f64 {
        percentage_of(self.units_done, self.total)
    }

    /// Whether a progress line is due, by percentage step or elapsed time.
    pub fn should_emit_update(&self) -> bool {
        if self.processed_this_run() == 0 {
            return false;
        }
        if self.percentage() - self.last_reported_percentage >= self.min_percentage_step {
            return true;
        }
        self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress line.
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        self.last_reported_percentage = self.percentage();
    }

    /// Estimated time until every remaining unit is processed.
    pub fn estimate_remaining(&self) -> Option<Duration> {
        if self.current_rate <= 0.0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.units_done);
        if remaining == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / self.current_rate))
    }

    /// Human-readable progress line.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] Processed {}/{} units - {:.1}% complete",
            self.units_done,
            self.total,
            self.percentage()
        )];

        if self.resumed_from > 0 {
            parts.push(format!("({} resumed)", self.resumed_from));
        }

        if self.units_failed > 0 {
            parts.push(format!("({} failed)", self.units_failed));
        }

        if self.current_rate > 0.0 {
            parts.push(format!("at {:.2} units/sec", self.current_rate));
        }

        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }
}

fn percentage_of(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done as f64 / total as f64) * 100.0
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
