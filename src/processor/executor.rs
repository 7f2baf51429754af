//! Resumable processor: checkpointed execution of ordered work units

use super::config::{FailurePolicy, MismatchPolicy, ProcessorConfig};
use super::control::{LoopState, ProcessorControl, SharedControl};
use super::progress::{ProgressState, ProgressTracker};
use super::work::{ErrorClass, WorkFunction, WorkUnit};
use super::ProcessorError;
use crate::identity::{fingerprint, validate_identity};
use crate::metrics::JobMetrics;
use crate::resume::{JobState, JobStatus, StateStore};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Callback invoked with `(completed, total, loop_state)` after every unit and
/// on every pause transition.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, LoopState) + Send + Sync>;

/// Identifies one job and the configuration it runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    identity: String,
    label: Option<String>,
    fingerprint: Option<String>,
}

impl JobSpec {
    /// Job with the given identity and no fingerprint
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            label: None,
            fingerprint: None,
        }
    }

    /// Attach a human-readable label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attach a precomputed configuration fingerprint
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Fingerprint `config` and attach it
    pub fn with_config<T: Serialize + ?Sized>(
        self,
        config: &T,
    ) -> Result<Self, crate::identity::IdentityError> {
        Ok(self.with_fingerprint(fingerprint(config)?))
    }

    /// Job identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Job label
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Configuration fingerprint
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }
}

/// Result of a [`ResumableProcessor::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome<T> {
    /// Results of successful units, in unit order
    pub results: Vec<T>,
    /// Whether every unit was attempted; `false` after a stop
    pub completed: bool,
    /// Units that failed recoverably, with their last error
    pub failed_units: BTreeMap<usize, String>,
}

/// Drives a work function over a unit list with checkpointing
pub struct ResumableProcessor {
    store: Arc<StateStore>,
    control: SharedControl,
    config: ProcessorConfig,
    progress_tracker: ProgressTracker,
    progress_callback: Option<ProgressCallback>,
}

impl ResumableProcessor {
    /// Create a processor backed by `store`
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            control: ProcessorControl::shared(),
            config: ProcessorConfig::default(),
            progress_tracker: ProgressTracker::default(),
            progress_callback: None,
        }
    }

    /// Use an externally owned control handle
    pub fn with_control(mut self, control: SharedControl) -> Self {
        self.control = control;
        self
    }

    /// Set the processor configuration
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Customize progress log cadence
    pub fn with_progress_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.progress_tracker = tracker;
        self
    }

    /// Register a progress callback
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize, LoopState) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Control handle of this processor
    pub fn control(&self) -> SharedControl {
        Arc::clone(&self.control)
    }

    /// State store of this processor
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Process `units` for `job`, resuming from a checkpoint when possible.
    ///
    /// Returns `completed == false` when stopped; the job then stays on disk as
    /// paused. A fatal unit error is returned after the job was persisted as
    /// failed.
    pub async fn run<U, W>(
        &self,
        job: &JobSpec,
        units: &[U],
        work: &W,
    ) -> Result<ProcessOutcome<W::Output>, ProcessorError>
    where
        U: WorkUnit + Sync,
        W: WorkFunction<U>,
    {
        let span = info_span!("job", identity = %job.identity, units = units.len());
        self.run_inner(job, units, work).instrument(span).await
    }

    async fn run_inner<U, W>(
        &self,
        job: &JobSpec,
        units: &[U],
        work: &W,
    ) -> Result<ProcessOutcome<W::Output>, ProcessorError>
    where
        U: WorkUnit + Sync,
        W: WorkFunction<U>,
    {
        validate_identity(&job.identity)?;
        validate_units(units)?;

        let total = units.len();
        let metrics = JobMetrics::start(&job.identity, total);
        let mut state = self.prepare_state(job, total).await?;

        state.transition(JobStatus::Running)?;
        self.control.set_loop_state(LoopState::Running);
        self.checkpoint(&state, &metrics).await?;

        let mut results = restore_results::<W::Output>(&state)?;
        let mut progress = self
            .progress_tracker
            .create_state(total, state.completed_count());

        for unit in units {
            if self.control.is_stop_requested() {
                return self.stop(state, results, &metrics).await;
            }

            if self.control.is_paused() && !self.pause_gate(&mut state, &metrics).await? {
                return self.stop(state, results, &metrics).await;
            }

            let index = unit.index();
            if state.is_unit_completed(index) {
                continue;
            }

            let started = Instant::now();
            match work.process(unit).await {
                Ok(output) => {
                    let value = serde_json::to_value(&output)
                        .map_err(|e| ProcessorError::Serialization(e.to_string()))?;
                    let usage = work.usage(&output);
                    state.record_success(index, value, usage.as_ref());
                    results.insert(index, output);
                    self.checkpoint(&state, &metrics).await?;

                    metrics.record_unit_success(started.elapsed());
                    progress.record_success();
                    debug!(index, completed = state.completed_count(), total, "Unit completed");
                }
                Err(err) => {
                    let class = match self.config.failure_policy {
                        FailurePolicy::FailFast => ErrorClass::Fatal,
                        FailurePolicy::ContinueOnRecoverable => work.classify(&err),
                    };
                    match class {
                        ErrorClass::Recoverable => {
                            warn!(index, error = %err, "Unit failed, continuing");
                            state.record_failure(index, err.to_string());
                            self.checkpoint(&state, &metrics).await?;
                            metrics.record_unit_failure("recoverable");
                            progress.record_failure();
                        }
                        ErrorClass::Fatal => {
                            return Err(self.abort(state, index, err, &metrics).await);
                        }
                    }
                }
            }

            self.report_progress(&state, &mut progress, LoopState::Running);
        }

        self.finish(state, results, &metrics).await
    }

    /// Load a matching resumable record or create a fresh state
    async fn prepare_state(&self, job: &JobSpec, total: usize) -> Result<JobState, ProcessorError> {
        let store = Arc::clone(&self.store);
        let identity = job.identity.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&identity))
            .await
            .map_err(|e| ProcessorError::TaskJoin(e.to_string()))?;

        match loaded {
            Some(state) if state.is_resumable() => {
                let mut reasons = Vec::new();
                if state.config_fingerprint() != job.fingerprint() {
                    reasons.push(format!(
                        "config fingerprint {} != {}",
                        state.config_fingerprint().unwrap_or("<none>"),
                        job.fingerprint().unwrap_or("<none>")
                    ));
                }
                if state.total_units() != total {
                    reasons.push(format!("unit count {} != {total}", state.total_units()));
                }

                if reasons.is_empty() {
                    info!(
                        completed = state.completed_count(),
                        total,
                        failed = state.failed_units().len(),
                        next_unit = state.next_unit_index(),
                        "Resuming job from checkpoint"
                    );
                    return Ok(state);
                }

                let reason = reasons.join(", ");
                match self.config.mismatch_policy {
                    MismatchPolicy::Fail => {
                        return Err(ProcessorError::ConfigMismatch {
                            identity: job.identity.clone(),
                            reason,
                        });
                    }
                    MismatchPolicy::StartFresh => {
                        warn!(%reason, "Stored state does not match this run, starting fresh");
                    }
                }
            }
            Some(state) => {
                info!(status = %state.status(), "Stored state is not resumable, starting fresh");
            }
            None => {
                debug!("No stored state, starting fresh");
            }
        }

        Ok(JobState::new(job.identity.clone(), total)
            .with_label(job.label.clone())
            .with_fingerprint(job.fingerprint.clone()))
    }

    /// Persist `paused`, wait for resume or stop. Returns `false` on stop.
    async fn pause_gate(
        &self,
        state: &mut JobState,
        metrics: &JobMetrics,
    ) -> Result<bool, ProcessorError> {
        state.transition(JobStatus::Paused)?;
        self.checkpoint(state, metrics).await?;
        self.control.set_loop_state(LoopState::Paused);
        metrics.record_paused();
        info!(
            completed = state.completed_count(),
            total = state.total_units(),
            "Job paused"
        );
        self.notify(state, LoopState::Paused);

        if !self.control.wait_while_paused().await {
            return Ok(false);
        }

        state.transition(JobStatus::Running)?;
        self.checkpoint(state, metrics).await?;
        self.control.set_loop_state(LoopState::Running);
        info!("Job resumed");
        self.notify(state, LoopState::Running);
        Ok(true)
    }

    /// Leave the job paused on disk and return what has been done so far
    async fn stop<T>(
        &self,
        mut state: JobState,
        results: BTreeMap<usize, T>,
        metrics: &JobMetrics,
    ) -> Result<ProcessOutcome<T>, ProcessorError> {
        if state.status() != JobStatus::Paused {
            state.transition(JobStatus::Paused)?;
            self.checkpoint(&state, metrics).await?;
            metrics.record_paused();
        }
        self.control.reset();
        info!(
            completed = state.completed_count(),
            total = state.total_units(),
            "Job stopped, progress saved"
        );
        self.notify(&state, LoopState::Idle);

        Ok(ProcessOutcome {
            results: results.into_values().collect(),
            completed: false,
            failed_units: state.failed_units().clone(),
        })
    }

    /// Persist `failed` and build the error to return
    async fn abort<E>(
        &self,
        mut state: JobState,
        index: usize,
        err: E,
        metrics: &JobMetrics,
    ) -> ProcessorError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = err.to_string();
        error!(index, error = %message, "Unit failed fatally, aborting job");

        match state.fail(format!("unit {index}: {message}")) {
            Ok(()) => {
                if let Err(e) = self.checkpoint(&state, metrics).await {
                    error!(error = %e, "Failed to persist failed job state");
                }
            }
            Err(e) => error!(error = %e, "Cannot mark job failed"),
        }

        self.control.clear_requests();
        self.control.set_loop_state(LoopState::Failed);
        metrics.record_failed(&message);
        self.notify(&state, LoopState::Failed);

        ProcessorError::UnitFatal {
            index,
            source: Box::new(err),
        }
    }

    /// Every unit has been attempted: clear the checkpoint and return results
    async fn finish<T>(
        &self,
        mut state: JobState,
        results: BTreeMap<usize, T>,
        metrics: &JobMetrics,
    ) -> Result<ProcessOutcome<T>, ProcessorError> {
        if state.covers_all_units() {
            state.transition(JobStatus::Completed)?;
        }

        let store = Arc::clone(&self.store);
        let identity = state.identity().to_string();
        tokio::task::spawn_blocking(move || store.clear(&identity))
            .await
            .map_err(|e| ProcessorError::TaskJoin(e.to_string()))??;

        self.control.clear_requests();
        self.control.set_loop_state(LoopState::Completed);
        metrics.record_completed(state.completed_count(), state.failed_units().len());
        self.notify(&state, LoopState::Completed);

        Ok(ProcessOutcome {
            results: results.into_values().collect(),
            completed: true,
            failed_units: state.failed_units().clone(),
        })
    }

    /// Save a snapshot of `state` on the blocking pool
    async fn checkpoint(&self, state: &JobState, metrics: &JobMetrics) -> Result<(), ProcessorError> {
        let store = Arc::clone(&self.store);
        let snapshot = state.clone();
        let started = Instant::now();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| ProcessorError::TaskJoin(e.to_string()))??;
        metrics.record_checkpoint(started.elapsed());
        Ok(())
    }

    fn report_progress(&self, state: &JobState, progress: &mut ProgressState, loop_state: LoopState) {
        if progress.should_emit_update() {
            info!("{}", progress.format_progress());
            progress.mark_emitted();
        }
        self.notify(state, loop_state);
    }

    fn notify(&self, state: &JobState, loop_state: LoopState) {
        if let Some(callback) = &self.progress_callback {
            callback(state.completed_count(), state.total_units(), loop_state);
        }
    }
}

/// Unit indices must be unique and cover `0..units.len()`
fn validate_units<U: WorkUnit>(units: &[U]) -> Result<(), ProcessorError> {
    let total = units.len();
    let mut seen = HashSet::with_capacity(total);
    for unit in units {
        let index = unit.index();
        if index >= total {
            return Err(ProcessorError::InvalidUnits(format!(
                "unit index {index} out of range for {total} units"
            )));
        }
        if !seen.insert(index) {
            return Err(ProcessorError::InvalidUnits(format!(
                "duplicate unit index {index}"
            )));
        }
    }
    Ok(())
}

/// Rebuild typed results from a checkpoint
fn restore_results<T: serde::de::DeserializeOwned>(
    state: &JobState,
) -> Result<BTreeMap<usize, T>, ProcessorError> {
    state
        .unit_results()
        .iter()
        .map(|(index, value)| {
            serde_json::from_value(value.clone())
                .map(|result| (*index, result))
                .map_err(|e| {
                    ProcessorError::Serialization(format!("stored result of unit {index}: {e}"))
                })
        })
        .collect()
}
