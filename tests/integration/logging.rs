//! Integration tests for logging and tracing

use super::support::{chunks, ScriptedWork, JOB};
use resumable_batch::processor::{JobSpec, ResumableProcessor};
use resumable_batch::resume::StateStore;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// In-memory log sink
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_tracing_subscriber_initialization() {
    // Either succeeds or fails because already initialized (both are OK)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("resumable_batch=debug")),
        )
        .with_test_writer()
        .try_init();

    info!("This is an info message");
    warn!("This is a warning message");
    error!("This is an error message");
}

#[test]
fn test_env_filter_parsing() {
    for directive in [
        "info",
        "resumable_batch=debug",
        "warn,resumable_batch=trace",
        "resumable_batch::resume=debug,resumable_batch=info",
    ] {
        assert!(EnvFilter::try_new(directive).is_ok(), "{directive}");
    }
}

#[tokio::test]
async fn test_processor_logs_inside_job_span() {
    let sink = Captured::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("resumable_batch=debug"))
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path()).unwrap());
    ResumableProcessor::new(store)
        .run(&JobSpec::new(JOB), &chunks(3), &ScriptedWork::new().recoverable_at(1))
        .await
        .unwrap();

    let logs = sink.contents();
    assert!(logs.contains("Job started"), "{logs}");
    assert!(logs.contains(&format!("identity={JOB}")), "{logs}");
    assert!(logs.contains("Unit failed, continuing"), "{logs}");
    assert!(logs.contains("rate limited"), "{logs}");
    assert!(logs.contains("Job finished"), "{logs}");
}

#[tokio::test]
async fn test_json_log_lines_carry_structured_fields() {
    let sink = Captured::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new("resumable_batch=info"))
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path()).unwrap());
    let processor = ResumableProcessor::new(store);
    let control = processor.control();
    let work = ScriptedWork::new().with_hook(move |index| {
        if index == 0 {
            control.request_stop();
        }
    });
    processor
        .run(&JobSpec::new(JOB), &chunks(3), &work)
        .await
        .unwrap();

    let stopped = sink
        .contents()
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .find(|line| line["fields"]["message"] == "Job stopped, progress saved")
        .expect("stop event logged");
    assert_eq!(stopped["level"], "INFO");
    assert_eq!(stopped["fields"]["completed"], 1);
    assert_eq!(stopped["fields"]["total"], 3);
    assert_eq!(stopped["span"]["identity"], JOB);
}
