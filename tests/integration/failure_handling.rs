//! Integration tests for recoverable and fatal unit failures

use super::support::{chunks, expected_results, Chunk, ScriptedWork, JOB};
use async_trait::async_trait;
use resumable_batch::processor::{
    FailurePolicy, JobSpec, ProcessorConfig, ProcessorError, ResumableProcessor, WorkFunction,
};
use resumable_batch::resume::{JobStatus, StateStore, StoreError};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn processor_in(dir: &TempDir) -> ResumableProcessor {
    let store = Arc::new(StateStore::open(dir.path()).unwrap());
    ResumableProcessor::new(store)
}

#[tokio::test]
async fn test_recoverable_failure_is_recorded_and_skipped() {
    let dir = TempDir::new().unwrap();
    let processor = processor_in(&dir);
    let work = ScriptedWork::new().recoverable_at(2);

    let outcome = processor
        .run(&JobSpec::new(JOB), &chunks(5), &work)
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.results, vec!["UNIT 0", "UNIT 1", "UNIT 3", "UNIT 4"]);
    assert_eq!(outcome.failed_units.len(), 1);
    assert!(outcome.failed_units[&2].contains("rate limited"));
    assert_eq!(work.calls(), vec![0, 1, 2, 3, 4]);
    assert!(processor.store().load(JOB).is_none());
}

#[tokio::test]
async fn test_recoverable_failure_is_retried_on_resume() {
    let dir = TempDir::new().unwrap();
    let units = chunks(5);

    let first = processor_in(&dir);
    let control = first.control();
    let flaky = ScriptedWork::new().recoverable_at(1).with_hook(move |index| {
        if index == 3 {
            control.request_stop();
        }
    });
    let outcome = first.run(&JobSpec::new(JOB), &units, &flaky).await.unwrap();
    assert!(!outcome.completed);
    assert_eq!(outcome.failed_units.keys().copied().collect::<Vec<_>>(), vec![1]);

    let state = first.store().load(JOB).unwrap();
    assert_eq!(state.completed_count(), 3);
    assert_eq!(state.remaining_units(), vec![4]);
    assert_eq!(state.next_unit_index(), 1);

    let healthy = ScriptedWork::new();
    let outcome = processor_in(&dir)
        .run(&JobSpec::new(JOB), &units, &healthy)
        .await
        .unwrap();
    assert!(outcome.completed);
    assert_eq!(healthy.calls(), vec![1, 4]);
    assert_eq!(outcome.results, expected_results(5));
    assert!(outcome.failed_units.is_empty());
}

#[tokio::test]
async fn test_fail_fast_treats_recoverable_as_fatal() {
    let dir = TempDir::new().unwrap();
    let processor = processor_in(&dir)
        .with_config(ProcessorConfig::new().with_failure_policy(FailurePolicy::FailFast));
    let work = ScriptedWork::new().recoverable_at(1);

    let err = processor
        .run(&JobSpec::new(JOB), &chunks(4), &work)
        .await
        .unwrap_err();
    assert_eq!(err.unit_index(), Some(1));
    assert_eq!(work.calls(), vec![0, 1]);

    let state = processor.store().load(JOB).unwrap();
    assert_eq!(state.status(), JobStatus::Failed);
    assert_eq!(state.completed_count(), 1);
    assert!(state.failed_units().is_empty());
}

/// Work function relying on the default classification
struct DiskFull;

#[async_trait]
impl WorkFunction<Chunk> for DiskFull {
    type Output = String;
    type Error = std::io::Error;

    async fn process(&self, unit: &Chunk) -> Result<String, std::io::Error> {
        if unit.index == 1 {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        }
        Ok(unit.text.clone())
    }
}

#[tokio::test]
async fn test_unclassified_errors_are_fatal() {
    let dir = TempDir::new().unwrap();
    let processor = processor_in(&dir);

    let err = processor
        .run(&JobSpec::new(JOB), &chunks(3), &DiskFull)
        .await
        .unwrap_err();

    match err {
        ProcessorError::UnitFatal { index, source } => {
            assert_eq!(index, 1);
            let io = source.downcast_ref::<std::io::Error>().unwrap();
            assert_eq!(io.to_string(), "disk full");
        }
        other => panic!("Expected UnitFatal, got {other:?}"),
    }
    assert_eq!(
        processor.store().load(JOB).unwrap().fatal_error(),
        Some("unit 1: disk full")
    );
}

#[tokio::test]
async fn test_checkpoint_busy_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        StateStore::open(dir.path())
            .unwrap()
            .with_lock_timeout(Duration::from_millis(50)),
    );

    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let lock = store.lock(JOB);
    let holder = std::thread::spawn(move || {
        lock.exclusive(|| {
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(())
        })
        .unwrap();
    });
    locked_rx.recv().unwrap();

    let processor = ResumableProcessor::new(Arc::clone(&store));
    let work = ScriptedWork::new();
    let err = processor
        .run(&JobSpec::new(JOB), &chunks(2), &work)
        .await
        .unwrap_err();

    assert!(err.is_busy());
    assert!(matches!(err, ProcessorError::Store(StoreError::Busy { .. })));
    assert!(work.calls().is_empty());

    release_tx.send(()).unwrap();
    holder.join().unwrap();
}
