//! Maintenance Integration Tests
//!
//! Dry runs report without writing; `apply` writes and leaves nothing
//! unresolved on a second run.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use voicebot::domain::{Message, QueueName, Session, SessionLogEvent};
use voicebot::finalize::QueueSideEffects;
use voicebot::maintenance::{backfill_runtime_tag, close_idle, dedupe_webm, MaintenanceError, MaintenanceOptions};
use voicebot::queue::{JobQueue, JsonlJobQueue};
use voicebot::store::{Collection, DocumentStore, Repo, RuntimeScope, SqliteStore};

fn apply() -> MaintenanceOptions {
    MaintenanceOptions {
        apply: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_close_idle_uses_latest_activity() {
    let temp = TempDir::new().unwrap();
    let repo = Repo::new(Arc::new(SqliteStore::open_in_memory().unwrap()), RuntimeScope::new("prod"));
    let queue = Arc::new(JsonlJobQueue::new(temp.path().to_path_buf()));
    let effects = QueueSideEffects::new(queue.clone());
    let now = Utc::now();

    // Idle: nothing newer than 6 hours
    repo.insert_session(&Session::new("idle", now - Duration::hours(8))).await.unwrap();
    repo.insert_message(&Message::new("m-idle", "1", "idle", now - Duration::hours(6)))
        .await
        .unwrap();

    // Busy: old session record but a recent log event
    repo.insert_session(&Session::new("busy", now - Duration::hours(8))).await.unwrap();
    repo.insert_log_event(&SessionLogEvent::new("busy", "message_received", now - Duration::minutes(30)))
        .await
        .unwrap();

    let dry = close_idle(&repo, &effects, 4.0, now, &MaintenanceOptions::default()).await.unwrap();
    assert_eq!(dry.candidates.len(), 1);
    assert_eq!(dry.candidates[0].session_id, "idle");
    assert!(dry.closed.is_empty());
    assert!(dry.unresolved());
    assert!(repo.get_session("idle").await.unwrap().unwrap().is_active);

    let applied = close_idle(&repo, &effects, 4.0, now, &apply()).await.unwrap();
    assert_eq!(applied.closed, vec!["idle".to_string()]);
    assert!(!applied.unresolved());

    let session = repo.get_session("idle").await.unwrap().unwrap();
    assert!(!session.is_active);
    assert!(session.done_at.is_some());
    assert_eq!(queue.jobs(QueueName::Processors).await.unwrap().len(), 1);

    let again = close_idle(&repo, &effects, 4.0, now, &apply()).await.unwrap();
    assert!(again.candidates.is_empty());
    assert!(!again.unresolved());
}

#[tokio::test]
async fn test_close_idle_respects_session_filter_and_limit() {
    let temp = TempDir::new().unwrap();
    let repo = Repo::new(Arc::new(SqliteStore::open_in_memory().unwrap()), RuntimeScope::new("prod"));
    let effects = QueueSideEffects::new(Arc::new(JsonlJobQueue::new(temp.path().to_path_buf())));
    let now = Utc::now();

    for (id, hours) in [("a", 10), ("b", 9), ("c", 8)] {
        repo.insert_session(&Session::new(id, now - Duration::hours(hours))).await.unwrap();
    }

    let limited = MaintenanceOptions {
        limit: Some(2),
        ..Default::default()
    };
    let report = close_idle(&repo, &effects, 4.0, now, &limited).await.unwrap();
    let ids: Vec<_> = report.candidates.iter().map(|c| c.session_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    let one = MaintenanceOptions {
        session_id: Some("c".to_string()),
        ..Default::default()
    };
    let report = close_idle(&repo, &effects, 4.0, now, &one).await.unwrap();
    assert_eq!(report.candidates.len(), 1);
    assert_eq!(report.candidates[0].session_id, "c");
}

#[tokio::test]
async fn test_close_idle_rejects_out_of_range_hours() {
    let temp = TempDir::new().unwrap();
    let repo = Repo::new(Arc::new(SqliteStore::open_in_memory().unwrap()), RuntimeScope::new("prod"));
    let effects = QueueSideEffects::new(Arc::new(JsonlJobQueue::new(temp.path().to_path_buf())));
    let now = Utc::now();
    repo.insert_session(&Session::new("S1", now - Duration::hours(8))).await.unwrap();

    for hours in [1e20, -2.0, 0.0, f64::INFINITY] {
        let err = close_idle(&repo, &effects, hours, now, &apply()).await.unwrap_err();
        assert!(matches!(err, MaintenanceError::InvalidThreshold(_)), "{hours}: {err}");
    }
    assert!(repo.get_session("S1").await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn test_dedupe_dry_run_writes_nothing() {
    let repo = Repo::new(Arc::new(SqliteStore::open_in_memory().unwrap()), RuntimeScope::new("prod"));
    let now = Utc::now();
    repo.insert_session(&Session::new("S1", now)).await.unwrap();

    for (id, offset) in [("a", 0), ("b", 1)] {
        let mut m = Message::new(id, id, "S1", now + Duration::seconds(offset));
        m.file_name = Some("recording.webm".to_string());
        m.file_size = Some(2048);
        repo.insert_message(&m).await.unwrap();
    }

    let report = dedupe_webm(&repo, now, &MaintenanceOptions::default()).await.unwrap();
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.soft_deleted, 0);
    assert!(report.unresolved());
    assert!(!repo.get_message("b").await.unwrap().unwrap().is_deleted);
}

#[tokio::test]
async fn test_backfill_tags_legacy_records_only() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let repo = Repo::new(store.clone(), RuntimeScope::new("prod"));

    // Legacy rows written before runtime tagging
    for id in ["legacy-1", "legacy-2"] {
        store
            .insert(
                Collection::Sessions,
                serde_json::json!({
                    "id": id,
                    "is_active": true,
                    "created_at": "2024-01-01T00:00:00Z",
                    "updated_at": "2024-01-01T00:00:00Z",
                }),
            )
            .await
            .unwrap();
    }
    repo.insert_session(&Session::new("tagged", Utc::now())).await.unwrap();

    // A dev record is neither visible nor touched
    let dev = Repo::new(store.clone(), RuntimeScope::new("dev-alice"));
    dev.insert_session(&Session::new("dev", Utc::now())).await.unwrap();

    let dry = backfill_runtime_tag(&repo, &MaintenanceOptions::default()).await.unwrap();
    let sessions = dry.collections.iter().find(|c| c.collection == "sessions").unwrap();
    assert_eq!(sessions.untagged, 2);
    assert_eq!(sessions.tagged, 0);
    assert!(dry.unresolved());

    let applied = backfill_runtime_tag(&repo, &apply()).await.unwrap();
    assert!(!applied.unresolved());
    let legacy = repo.get_session("legacy-1").await.unwrap().unwrap();
    assert_eq!(legacy.runtime_tag.as_deref(), Some("prod"));
    assert_eq!(
        dev.get_session("dev").await.unwrap().unwrap().runtime_tag.as_deref(),
        Some("dev-alice")
    );

    let again = backfill_runtime_tag(&repo, &MaintenanceOptions::default()).await.unwrap();
    assert!(again.collections.iter().all(|c| c.untagged == 0));
    assert!(!again.unresolved());
}
