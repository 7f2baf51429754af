//! Integration tests for loading records written by the 1.0 schema

use super::support::Chunk;
use async_trait::async_trait;
use resumable_batch::identity::storage_stem;
use resumable_batch::processor::{JobSpec, ResumableProcessor, UnitError, WorkFunction};
use resumable_batch::resume::{FileHealth, JobStatus, StateStore, SCHEMA_VERSION};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const LEGACY_ID: &str = "a1b2c3d4e5f6";

fn legacy_config() -> Value {
    json!({"model": "small", "temperature": 0.2})
}

fn legacy_record() -> Value {
    json!({
        "version": "1.0",
        "file_id": LEGACY_ID,
        "file_name": "talk.srt",
        "video_title": "",
        "status": "paused",
        "started_at": "2024-03-01T10:00:00+00:00",
        "last_updated": "2024-03-01T10:05:00+00:00",
        "config": legacy_config(),
        "total_chunks": 4,
        "completed_chunks": [0, 1, 2],
        "failed_chunks": {"3": "timeout"},
        "processed_results": [
            {"chunk_index": 0, "text": "UNIT 0"},
            {"chunk_index": 1, "text": "UNIT 1"}
        ],
        "actual_cost": 0.75,
        "total_input_tokens": 120,
        "total_output_tokens": 80
    })
}

fn write_legacy(store: &StateStore, record: &Value) {
    let path = store.dir().join(format!("{}.json", storage_stem(LEGACY_ID)));
    std::fs::write(path, serde_json::to_string_pretty(record).unwrap()).unwrap();
}

#[test]
fn test_legacy_record_is_migrated_on_load() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    write_legacy(&store, &legacy_record());

    let state = store.load(LEGACY_ID).unwrap();
    assert_eq!(state.schema_version(), SCHEMA_VERSION);
    assert_eq!(state.status(), JobStatus::Paused);
    assert_eq!(state.label(), Some("talk.srt"));
    assert_eq!(state.total_units(), 4);
    // Unit 2 was marked complete without a cached result
    assert_eq!(state.completed_count(), 2);
    assert!(!state.is_unit_completed(2));
    assert_eq!(state.failed_units().get(&3).map(String::as_str), Some("timeout"));
    assert_eq!(state.usage().input_tokens, 120);
    assert_eq!(state.usage().output_tokens, 80);
    assert!((state.usage().cost - 0.75).abs() < f64::EPSILON);
    assert_eq!(state.created_at().to_rfc3339(), "2024-03-01T10:00:00+00:00");
    assert!(state.is_resumable());
}

#[test]
fn test_migrated_record_is_saved_in_current_schema() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    write_legacy(&store, &legacy_record());

    let state = store.load(LEGACY_ID).unwrap();
    store.save(&state).unwrap();

    let raw = std::fs::read_to_string(store.primary_path(LEGACY_ID)).unwrap();
    let record: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["schema_version"], SCHEMA_VERSION);
    assert_eq!(record["identity"], LEGACY_ID);
    assert!(record.get("version").is_none());

    // The legacy text survives as the backup
    let backup = std::fs::read_to_string(store.backup_path(LEGACY_ID)).unwrap();
    assert!(backup.contains("\"version\": \"1.0\""));
}

/// Returns the same result shape the legacy writer cached
#[derive(Default)]
struct LegacyShapedWork {
    calls: Mutex<Vec<usize>>,
}

#[async_trait]
impl WorkFunction<Chunk> for LegacyShapedWork {
    type Output = Value;
    type Error = UnitError;

    async fn process(&self, unit: &Chunk) -> Result<Value, UnitError> {
        self.calls.lock().unwrap().push(unit.index);
        Ok(json!({"chunk_index": unit.index, "text": unit.text.to_uppercase()}))
    }
}

#[tokio::test]
async fn test_legacy_job_resumes_with_matching_config() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path()).unwrap());
    write_legacy(&store, &legacy_record());

    let units = super::support::chunks(4);
    let job = JobSpec::new(LEGACY_ID).with_config(&legacy_config()).unwrap();
    let work = LegacyShapedWork::default();

    let outcome = ResumableProcessor::new(Arc::clone(&store))
        .run(&job, &units, &work)
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(*work.calls.lock().unwrap(), vec![2, 3]);
    let texts: Vec<&str> = outcome
        .results
        .iter()
        .map(|r| r["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["UNIT 0", "UNIT 1", "UNIT 2", "UNIT 3"]);
    assert!(store.load(LEGACY_ID).is_none());
}

#[tokio::test]
async fn test_legacy_job_with_different_config_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path()).unwrap());
    write_legacy(&store, &legacy_record());

    let job = JobSpec::new(LEGACY_ID)
        .with_config(&json!({"model": "large", "temperature": 0.2}))
        .unwrap();
    let work = LegacyShapedWork::default();
    ResumableProcessor::new(store)
        .run(&job, &super::support::chunks(4), &work)
        .await
        .unwrap();

    assert_eq!(*work.calls.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn test_unknown_schema_version_is_treated_as_missing() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    let mut record = legacy_record();
    record["version"] = json!("0.5");
    write_legacy(&store, &record);

    assert!(store.load(LEGACY_ID).is_none());
    let report = store.verify().unwrap();
    match &report[0].primary {
        FileHealth::Corrupt { reason } => assert!(reason.contains("schema version mismatch")),
        other => panic!("Expected corrupt primary, got {other:?}"),
    }
}

#[test]
fn test_unknown_legacy_status_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    let mut record = legacy_record();
    record["status"] = json!("exploded");
    write_legacy(&store, &record);

    assert!(store.load(LEGACY_ID).is_none());
}
