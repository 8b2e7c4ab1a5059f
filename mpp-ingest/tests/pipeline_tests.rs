//! Integration tests for the ingest pipeline
//!
//! Covers the end-to-end properties: idempotent double-ingest, serial
//! per-subject processing, permanent-fault and retry-exhaustion
//! dead-lettering, and replay through the normal dedup check.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use mpp_common::events::{ActivityEvent, ActivityKind, ScoreUpdate};
use mpp_ingest::dead_letter::{DeadLetterEntry, DeadLetterStore};
use mpp_ingest::publisher::{PublishError, ResultPublisher};
use mpp_ingest::store::StateStore;
use mpp_ingest::{IngestConfig, IngestEngine, IngestError, Outcome};

/// Publisher that records everything it is asked to publish
#[derive(Default)]
struct RecordingPublisher {
    scores: Mutex<Vec<ScoreUpdate>>,
    dead_letters: Mutex<Vec<DeadLetterEntry>>,
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish_score(&self, update: &ScoreUpdate) -> Result<(), PublishError> {
        self.scores.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn publish_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), PublishError> {
        self.dead_letters.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

struct TestPipeline {
    engine: IngestEngine,
    store: StateStore,
    dead_letters: DeadLetterStore,
    publisher: Arc<RecordingPublisher>,
}

async fn setup_pipeline() -> TestPipeline {
    // In-memory SQLite: single connection so every component sees the
    // same database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    mpp_common::db::create_tables(&pool).await.unwrap();

    let store = StateStore::new(pool.clone());
    let dead_letters = DeadLetterStore::new(pool);
    let publisher = Arc::new(RecordingPublisher::default());

    let engine = IngestEngine::new(
        store.clone(),
        dead_letters.clone(),
        publisher.clone(),
        IngestConfig {
            lanes: 4,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        },
    );

    TestPipeline {
        engine,
        store,
        dead_letters,
        publisher,
    }
}

fn event_for(subject: &str, completion: f64) -> ActivityEvent {
    let mut payload = serde_json::Map::new();
    payload.insert(
        "components".to_string(),
        serde_json::json!({
            "completion": completion,
            "assessment": 0.9,
            "quality": 0.75,
            "consistency": 0.8
        }),
    );
    ActivityEvent {
        event_id: Uuid::new_v4(),
        kind: ActivityKind::LessonCompleted,
        occurred_at: Utc::now(),
        subject_id: subject.to_string(),
        payload,
        source: "test".to_string(),
    }
}

#[tokio::test]
async fn test_duplicate_event_processed_once() {
    let pipeline = setup_pipeline().await;
    let event = event_for("learner-1", 0.8);

    let first = pipeline.engine.ingest(event.clone()).await.unwrap();
    assert_eq!(first, Outcome::Processed);

    let second = pipeline.engine.ingest(event).await.unwrap();
    assert_eq!(second, Outcome::AlreadyProcessed);

    // Exactly one state commit: version 1, one snapshot, one publish
    let current = pipeline.store.read_current("learner-1").await.unwrap().unwrap();
    assert_eq!(current.version, 1);

    let history = pipeline
        .store
        .read_history("learner-1", None, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    assert_eq!(pipeline.publisher.scores.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_published_update_carries_previous_score() {
    let pipeline = setup_pipeline().await;

    pipeline
        .engine
        .ingest(event_for("learner-1", 0.4))
        .await
        .unwrap();
    pipeline
        .engine
        .ingest(event_for("learner-1", 0.8))
        .await
        .unwrap();

    let scores = pipeline.publisher.scores.lock().unwrap();
    assert_eq!(scores.len(), 2);
    assert_eq!(scores[0].previous_score, None);

    let expected_prev = scores[0].score.composite_score;
    assert_eq!(scores[1].previous_score, Some(expected_prev));
    assert_eq!(scores[1].score.version, 2);
}

#[tokio::test]
async fn test_invalid_event_bounced_without_side_effects() {
    let pipeline = setup_pipeline().await;
    let mut event = event_for("", 0.8);
    event.subject_id = "".to_string();

    let err = pipeline.engine.ingest(event).await.unwrap_err();
    assert!(matches!(err, IngestError::Invalid(_)));

    assert_eq!(pipeline.dead_letters.count().await.unwrap(), 0);
    assert!(pipeline.publisher.scores.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unprocessable_event_dead_lettered_immediately() {
    let pipeline = setup_pipeline().await;

    // Schema-valid but no components: permanent fault, no retries
    let mut event = event_for("learner-1", 0.8);
    event.payload.clear();

    let outcome = pipeline.engine.ingest(event.clone()).await.unwrap();
    assert_eq!(outcome, Outcome::DeadLettered);

    let entries = pipeline.dead_letters.list(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_id, event.event_id);
    assert_eq!(entries[0].error_kind, "permanent");
    assert_eq!(entries[0].retry_count, 1);

    // Dead-letter notification published, no score published
    assert_eq!(pipeline.publisher.dead_letters.lock().unwrap().len(), 1);
    assert!(pipeline.publisher.scores.lock().unwrap().is_empty());
    assert!(pipeline
        .store
        .read_current("learner-1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_retry_exhaustion_captures_with_full_budget() {
    // State store on a read-only connection: every commit attempt fails
    // as transient. The dead-letter store writes through a separate
    // read-write pool.
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("mpp.db");
    let url_rw = format!("sqlite://{}?mode=rwc", db_path.display());
    let url_ro = format!("sqlite://{}?mode=ro", db_path.display());

    let rw_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url_rw)
        .await
        .unwrap();
    mpp_common::db::create_tables(&rw_pool).await.unwrap();

    let ro_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url_ro)
        .await
        .unwrap();

    let store = StateStore::new(ro_pool);
    let dead_letters = DeadLetterStore::new(rw_pool);
    let publisher = Arc::new(RecordingPublisher::default());

    let engine = IngestEngine::new(
        store,
        dead_letters.clone(),
        publisher,
        IngestConfig {
            lanes: 2,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        },
    );

    let event = event_for("learner-1", 0.8);
    let outcome = engine.ingest(event.clone()).await.unwrap();
    assert_eq!(outcome, Outcome::DeadLettered);

    // Exactly one entry, retry_count equal to the configured budget
    let entries = dead_letters.list(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].retry_count, 3);
    assert_eq!(entries[0].error_kind, "transient");
    assert_eq!(entries[0].event_id, event.event_id);
}

#[tokio::test]
async fn test_replay_goes_through_dedup() {
    let pipeline = setup_pipeline().await;
    let event = event_for("learner-1", 0.8);

    // Capture an entry as if the event had failed, then replay it
    let entry = pipeline
        .dead_letters
        .capture(&event, "transient", "store offline", 3)
        .await
        .unwrap();

    let replayed = entry.original_event().unwrap();
    let outcome = pipeline.engine.ingest(replayed).await.unwrap();
    assert_eq!(outcome, Outcome::Processed);

    // A second replay of the same entry hits the idempotency record
    let again = entry.original_event().unwrap();
    assert_eq!(
        pipeline.engine.ingest(again).await.unwrap(),
        Outcome::AlreadyProcessed
    );
}

#[tokio::test]
async fn test_same_subject_serial_version_sequence() {
    let pipeline = setup_pipeline().await;

    for completion in [0.5, 0.55, 0.6, 0.65, 0.7] {
        pipeline
            .engine
            .ingest(event_for("learner-1", completion))
            .await
            .unwrap();
    }

    // Serial processing in one lane: versions advance without gaps
    let current = pipeline.store.read_current("learner-1").await.unwrap().unwrap();
    assert_eq!(current.version, 5);
    assert_eq!(current.components.completion, 0.7);
}

#[tokio::test]
async fn test_subjects_processed_concurrently() {
    let pipeline = setup_pipeline().await;

    let (a, b, c) = tokio::join!(
        pipeline.engine.ingest(event_for("subject-a", 0.6)),
        pipeline.engine.ingest(event_for("subject-b", 0.7)),
        pipeline.engine.ingest(event_for("subject-c", 0.8)),
    );
    assert_eq!(a.unwrap(), Outcome::Processed);
    assert_eq!(b.unwrap(), Outcome::Processed);
    assert_eq!(c.unwrap(), Outcome::Processed);

    for subject in ["subject-a", "subject-b", "subject-c"] {
        assert!(pipeline.store.read_current(subject).await.unwrap().is_some());
    }
}
