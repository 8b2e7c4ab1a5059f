//! Idempotent ingest engine
//!
//! Events are validated, deduplicated by `event_id`, then routed by a
//! consistent hash of `subject_id` to one of N processing lanes. Each
//! lane is a single worker task fed by an mpsc channel, so events for
//! the same subject are processed serially in arrival order while
//! different subjects proceed concurrently. Dedup check and state
//! commit run back to back inside the lane, which makes them a critical
//! section per event/subject pair.
//!
//! Transient failures get a bounded exponential backoff; exhausting the
//! budget (or hitting a permanent fault) captures the event in the
//! dead-letter store.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use mpp_common::events::{ActivityEvent, ScoreUpdate};
use mpp_common::score::{self, ComponentScores};

use crate::dead_letter::DeadLetterStore;
use crate::error::IngestError;
use crate::publisher::ResultPublisher;
use crate::store::{StateStore, StoreError};

/// Outcome of one ingest call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// First sight: calculated, committed, published
    Processed,
    /// Fresh idempotency record found; no side effects
    AlreadyProcessed,
    /// Retry budget exhausted; captured for review
    DeadLettered,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Processed => "processed",
            Outcome::AlreadyProcessed => "already_processed",
            Outcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Number of processing lanes (same-subject events share a lane)
    pub lanes: usize,
    /// Total attempts per event, including the first
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts
    pub retry_base_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

struct LaneJob {
    event: ActivityEvent,
    reply: oneshot::Sender<Result<Outcome, IngestError>>,
}

/// The idempotent ingestor
pub struct IngestEngine {
    lanes: Vec<mpsc::Sender<LaneJob>>,
}

impl IngestEngine {
    /// Spawn the lane workers and return the engine handle
    pub fn new(
        store: StateStore,
        dead_letters: DeadLetterStore,
        publisher: Arc<dyn ResultPublisher>,
        config: IngestConfig,
    ) -> Self {
        let mut lanes = Vec::with_capacity(config.lanes);
        for lane in 0..config.lanes.max(1) {
            let (tx, mut rx) = mpsc::channel::<LaneJob>(256);
            let worker = LaneWorker {
                lane,
                store: store.clone(),
                dead_letters: dead_letters.clone(),
                publisher: Arc::clone(&publisher),
                config: config.clone(),
            };
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let outcome = worker.handle(&job.event).await;
                    // Caller may have given up waiting; that's fine
                    let _ = job.reply.send(outcome);
                }
                debug!(lane = worker.lane, "Ingest lane stopped");
            });
            lanes.push(tx);
        }
        Self { lanes }
    }

    /// Ingest one activity event
    ///
    /// Validation failures return immediately and never enter a lane.
    pub async fn ingest(&self, event: ActivityEvent) -> Result<Outcome, IngestError> {
        event
            .validate()
            .map_err(|e| IngestError::Invalid(e.to_string()))?;

        let lane = lane_for(&event.subject_id, self.lanes.len());
        let (reply, rx) = oneshot::channel();
        self.lanes[lane]
            .send(LaneJob { event, reply })
            .await
            .map_err(|_| IngestError::Internal("ingest lane unavailable".to_string()))?;

        rx.await
            .map_err(|_| IngestError::Internal("ingest lane dropped reply".to_string()))?
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

/// Consistent lane choice for a subject (stable within the process)
fn lane_for(subject_id: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    subject_id.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

struct LaneWorker {
    lane: usize,
    store: StateStore,
    dead_letters: DeadLetterStore,
    publisher: Arc<dyn ResultPublisher>,
    config: IngestConfig,
}

impl LaneWorker {
    async fn handle(&self, event: &ActivityEvent) -> Result<Outcome, IngestError> {
        if self
            .store
            .is_processed(&event.event_id)
            .await
            .map_err(classify_store)?
        {
            debug!(event_id = %event.event_id, "Duplicate event, skipping");
            return Ok(Outcome::AlreadyProcessed);
        }

        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            match self.process_once(event).await {
                Ok(update) => {
                    // State is durably committed; a failed push is a
                    // delivery problem, not grounds for dead-lettering.
                    if let Err(e) = self.publisher.publish_score(&update).await {
                        warn!(
                            event_id = %event.event_id,
                            "Score committed but publish failed: {}", e
                        );
                    }
                    return Ok(Outcome::Processed);
                }
                Err(e) if e.is_transient() && attempt < self.config.retry_attempts => {
                    let backoff = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        event_id = %event.event_id,
                        attempt,
                        "Transient failure, retrying in {:?}: {}", backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => break e,
            }
        };

        match self
            .dead_letters
            .capture(event, error.kind_str(), &error.to_string(), attempt)
            .await
        {
            Ok(entry) => {
                if let Err(e) = self.publisher.publish_dead_letter(&entry).await {
                    warn!(entry_id = %entry.entry_id, "Dead-letter publish failed: {}", e);
                }
                Ok(Outcome::DeadLettered)
            }
            Err(capture_err) => Err(IngestError::Internal(format!(
                "dead-letter capture failed: {} (original error: {})",
                capture_err, error
            ))),
        }
    }

    /// One processing attempt: extract, calculate, commit
    ///
    /// The commit writes the idempotency record in the same transaction
    /// and is deterministic for the same input, so a replay that slips
    /// past the dedup check converges to the same state.
    async fn process_once(&self, event: &ActivityEvent) -> Result<ScoreUpdate, IngestError> {
        let components = extract_components(event)?;

        let previous = self
            .store
            .read_current(&event.subject_id)
            .await
            .map_err(classify_store)?;

        let result = score::calculate(&event.subject_id, components, Utc::now())
            .map_err(|e| IngestError::Permanent(e.to_string()))?;

        let stored = self
            .store
            .commit_with_event(&result, Some(event))
            .await
            .map_err(classify_store)?;

        Ok(ScoreUpdate {
            subject_id: event.subject_id.clone(),
            score: stored,
            previous_score: previous.map(|p| p.composite_score),
        })
    }
}

/// Pull component scores out of the event payload
///
/// An event that passed schema validation but has no usable components
/// is unprocessable: permanent, never retried.
fn extract_components(event: &ActivityEvent) -> Result<ComponentScores, IngestError> {
    let value = event.payload.get("components").ok_or_else(|| {
        IngestError::Permanent("event payload missing 'components'".to_string())
    })?;

    let components: ComponentScores = serde_json::from_value(value.clone())
        .map_err(|e| IngestError::Permanent(format!("malformed components: {}", e)))?;

    components
        .validate()
        .map_err(|e| IngestError::Permanent(e.to_string()))?;

    Ok(components)
}

fn classify_store(err: StoreError) -> IngestError {
    match err {
        // Store unavailable or raced by another writer: worth retrying
        StoreError::Database(e) => IngestError::Transient(e.to_string()),
        StoreError::VersionConflict { .. } => IngestError::Transient(err.to_string()),
        StoreError::Serialization(e) => IngestError::Permanent(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_for_is_stable_and_bounded() {
        let a = lane_for("learner-1", 4);
        assert_eq!(a, lane_for("learner-1", 4));
        assert!(a < 4);

        // Single lane degenerates gracefully
        assert_eq!(lane_for("anything", 1), 0);
    }

    #[test]
    fn test_extract_components() {
        let mut payload = serde_json::Map::new();
        payload.insert(
            "components".to_string(),
            serde_json::json!({
                "completion": 0.8,
                "assessment": 0.9,
                "quality": 0.75,
                "consistency": 0.8
            }),
        );
        let event = ActivityEvent {
            event_id: uuid::Uuid::new_v4(),
            kind: mpp_common::events::ActivityKind::LessonCompleted,
            occurred_at: Utc::now(),
            subject_id: "s".to_string(),
            payload,
            source: "test".to_string(),
        };

        let components = extract_components(&event).unwrap();
        assert_eq!(components.completion, 0.8);

        let mut missing = event.clone();
        missing.payload.clear();
        assert!(matches!(
            extract_components(&missing),
            Err(IngestError::Permanent(_))
        ));

        let mut out_of_range = event.clone();
        out_of_range.payload.insert(
            "components".to_string(),
            serde_json::json!({
                "completion": 1.8,
                "assessment": 0.9,
                "quality": 0.75,
                "consistency": 0.8
            }),
        );
        assert!(matches!(
            extract_components(&out_of_range),
            Err(IngestError::Permanent(_))
        ));
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(Outcome::Processed.as_str(), "processed");
        assert_eq!(Outcome::AlreadyProcessed.as_str(), "already_processed");
        assert_eq!(Outcome::DeadLettered.as_str(), "dead_lettered");
    }
}
