//! Metrics for batch job observability
//!
//! Counters and histograms for unit outcomes, checkpoint latency and job
//! lifecycle events, recorded through the `metrics` facade.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Optional Prometheus exporter for a scrape endpoint (`--metrics-addr`)
//! - Without an installed recorder every call is a no-op

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize the Prometheus exporter on `addr`.
///
/// Idempotent: later calls are no-ops once an exporter is installed.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "units_completed_total",
        Unit::Count,
        "Total number of work units completed"
    );

    describe_counter!(
        "units_failed_total",
        Unit::Count,
        "Total number of work unit failures by class"
    );

    describe_histogram!(
        "unit_duration_seconds",
        Unit::Seconds,
        "Work function duration per successful unit"
    );

    describe_histogram!(
        "checkpoint_duration_seconds",
        Unit::Seconds,
        "Time spent persisting a job state checkpoint"
    );

    describe_counter!(
        "jobs_completed_total",
        Unit::Count,
        "Total number of jobs that processed every unit"
    );

    describe_counter!(
        "jobs_paused_total",
        Unit::Count,
        "Total number of pause and stop events"
    );

    describe_counter!(
        "jobs_failed_total",
        Unit::Count,
        "Total number of jobs aborted by a fatal unit error"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if the metrics exporter is installed
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Per-job metrics recorder
#[derive(Debug, Clone)]
pub struct JobMetrics {
    identity: String,
    total_units: usize,
    start_time: Instant,
}

impl JobMetrics {
    /// Start tracking a job run
    pub fn start(identity: impl Into<String>, total_units: usize) -> Self {
        let identity = identity.into();
        info!(identity = %identity, total_units, "Job started");
        Self {
            identity,
            total_units,
            start_time: Instant::now(),
        }
    }

    /// Record a successful unit and its processing time
    pub fn record_unit_success(&self, duration: Duration) {
        counter!("units_completed_total").increment(1);
        histogram!("unit_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a unit failure of the given class
    pub fn record_unit_failure(&self, class: &'static str) {
        counter!("units_failed_total", "class" => class).increment(1);
    }

    /// Record the latency of one checkpoint save
    pub fn record_checkpoint(&self, duration: Duration) {
        histogram!("checkpoint_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a pause or stop
    pub fn record_paused(&self) {
        counter!("jobs_paused_total").increment(1);
    }

    /// Record a job that attempted every unit
    pub fn record_completed(&self, completed: usize, failed: usize) {
        counter!("jobs_completed_total").increment(1);
        info!(
            identity = %self.identity,
            completed,
            failed,
            total = self.total_units,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Job finished"
        );
    }

    /// Record a job aborted by a fatal error
    pub fn record_failed(&self, error: &str) {
        counter!("jobs_failed_total").increment(1);
        counter!("units_failed_total", "class" => "fatal").increment(1);
        debug!(
            identity = %self.identity,
            error = %error,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Job failure recorded"
        );
    }
}
