//! Integration tests for crash consistency of the state store

use resumable_batch::resume::{FileHealth, JobState, JobStatus, StateStore};
use serde_json::json;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tempfile::TempDir;

fn paused_job(identity: &str, completed: usize, total: usize) -> JobState {
    let mut state = JobState::new(identity, total);
    state.transition(JobStatus::Running).unwrap();
    for index in 0..completed {
        state.record_success(index, json!(format!("result {index}")), None);
    }
    state.transition(JobStatus::Paused).unwrap();
    state
}

#[test]
fn test_stray_temp_file_is_ignored() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    store.save(&paused_job("job-a", 2, 5)).unwrap();

    // Leftover of a writer that crashed before its rename
    std::fs::write(dir.path().join(".tmpA1b2C3"), "{\"schema_version\": \"2.0\", \"iden").unwrap();

    let loaded = store.load("job-a").unwrap();
    assert_eq!(loaded.completed_count(), 2);

    let jobs = store.list_jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].identity, "job-a");
    assert_eq!(store.verify().unwrap().len(), 1);
}

#[test]
fn test_truncated_primary_recovers_from_backup() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    store.save(&paused_job("job-a", 2, 5)).unwrap();
    store.save(&paused_job("job-a", 3, 5)).unwrap();

    let primary = store.primary_path("job-a");
    let raw = std::fs::read_to_string(&primary).unwrap();
    std::fs::write(&primary, &raw[..raw.len() / 2]).unwrap();

    let loaded = store.load("job-a").unwrap();
    assert_eq!(loaded.completed_count(), 2);
    assert_eq!(loaded.status(), JobStatus::Paused);

    let report = store.verify().unwrap();
    assert!(matches!(report[0].primary, FileHealth::Corrupt { .. }));
    assert!(report[0].backup.is_valid());
    assert!(report[0].is_recoverable());

    // The next save must not rotate the corrupt primary over the good backup
    store.save(&paused_job("job-a", 4, 5)).unwrap();
    let backup = std::fs::read_to_string(store.backup_path("job-a")).unwrap();
    let backup = JobState::from_record(serde_json::from_str(&backup).unwrap()).unwrap();
    assert_eq!(backup.completed_count(), 2);
    assert_eq!(store.load("job-a").unwrap().completed_count(), 4);
}

#[test]
fn test_both_slots_corrupt_loads_nothing() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    std::fs::write(store.primary_path("job-a"), "not json").unwrap();
    std::fs::write(store.backup_path("job-a"), "{\"schema_version\": \"9.9\"}").unwrap();

    assert!(store.load("job-a").is_none());
    assert!(!store.has_incomplete_job("job-a"));
    assert!(store.list_jobs().unwrap().is_empty());

    let report = store.verify().unwrap();
    assert_eq!(report.len(), 1);
    assert!(matches!(report[0].primary, FileHealth::Corrupt { .. }));
    match &report[0].backup {
        FileHealth::Corrupt { reason } => assert!(reason.contains("9.9"), "{reason}"),
        other => panic!("Expected corrupt backup, got {other:?}"),
    }
    assert!(!report[0].is_recoverable());
}

#[test]
fn test_record_of_another_identity_is_ignored() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    store.save(&paused_job("job-b", 1, 3)).unwrap();
    std::fs::copy(store.primary_path("job-b"), store.primary_path("job-a")).unwrap();

    assert!(store.load("job-a").is_none());
    assert_eq!(store.load("job-b").unwrap().identity(), "job-b");
}

#[test]
fn test_save_is_busy_while_lock_held() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path())
        .unwrap()
        .with_lock_timeout(Duration::from_millis(60));
    store.save(&paused_job("job-a", 1, 3)).unwrap();

    let result = store.lock("job-a").exclusive(|| Ok(store.save(&paused_job("job-a", 2, 3))));
    let err = result.unwrap().unwrap_err();
    assert!(err.is_busy());

    // Readers fall back to an unlocked read rather than failing
    let loaded = store
        .lock("job-a")
        .exclusive(|| Ok(store.load("job-a")))
        .unwrap()
        .unwrap();
    assert_eq!(loaded.completed_count(), 1);
}

#[test]
fn test_concurrent_saves_serialize() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path()).unwrap());

    let handles: Vec<_> = (1..=8)
        .map(|completed| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..5 {
                    store.save(&paused_job("job-a", completed, 10)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = store.verify().unwrap();
    assert!(report[0].primary.is_valid());
    assert!(report[0].backup.is_valid());
    let loaded = store.load("job-a").unwrap();
    assert!((1..=8).contains(&loaded.completed_count()));
}

#[test]
fn test_lock_waiter_proceeds_after_release() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        StateStore::open(dir.path())
            .unwrap()
            .with_lock_timeout(Duration::from_secs(5)),
    );

    let (locked_tx, locked_rx) = mpsc::channel();
    let lock = store.lock("job-a");
    let holder = std::thread::spawn(move || {
        lock.exclusive(|| {
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        })
        .unwrap();
    });
    locked_rx.recv().unwrap();

    store.save(&paused_job("job-a", 1, 2)).unwrap();
    holder.join().unwrap();
    assert_eq!(store.load("job-a").unwrap().completed_count(), 1);
}

#[test]
fn test_has_incomplete_job_by_status() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();

    store.save(&paused_job("paused", 1, 3)).unwrap();
    assert!(store.has_incomplete_job("paused"));

    let mut failed = JobState::new("failed", 3);
    failed.transition(JobStatus::Running).unwrap();
    failed.fail("unit 0: boom").unwrap();
    store.save(&failed).unwrap();
    assert!(!store.has_incomplete_job("failed"));
    assert_eq!(store.summary("failed").unwrap().fatal_error.as_deref(), Some("unit 0: boom"));

    assert!(!store.has_incomplete_job("missing"));
}

#[test]
fn test_clear_keeps_lock_file() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    store.save(&paused_job("job-a", 1, 3)).unwrap();
    store.save(&paused_job("job-a", 2, 3)).unwrap();

    store.clear("job-a").unwrap();
    assert!(!store.primary_path("job-a").exists());
    assert!(!store.backup_path("job-a").exists());
    assert!(store.lock_path("job-a").exists());
    assert!(store.verify().unwrap().is_empty());

    store.clear("job-a").unwrap();
}

#[test]
fn test_long_identities_use_hashed_stems() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    let identity = format!("tenant/{}", "x".repeat(100));
    store.save(&paused_job(&identity, 1, 2)).unwrap();

    let file_name = store.primary_path(&identity);
    let file_name = file_name.file_name().unwrap().to_string_lossy().into_owned();
    assert!(!file_name.contains('/'));
    assert!(file_name.len() < 64);

    assert_eq!(store.load(&identity).unwrap().identity(), identity);
    assert_eq!(store.list_jobs().unwrap()[0].identity, identity);
}
