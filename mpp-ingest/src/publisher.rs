//! Result publisher
//!
//! Emits derived events once state is committed: score updates toward
//! the bridge webhook, dead-letter notifications toward the review
//! topic. The trait is the seam; tests inject a recording impl.
//!
//! Publish failure is a delivery problem, not a processing problem:
//! the state commit already happened, so exhausted publish retries are
//! logged and the event is NOT dead-lettered.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use mpp_common::events::{AckStatus, Acknowledgment, ScoreUpdate};

use crate::dead_letter::DeadLetterEntry;

/// Publisher errors
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Bridge acknowledged with a non-retryable failure
    #[error("Publish rejected: {0}")]
    Rejected(String),

    #[error("Publish retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Seam between the ingest pipeline and the outbound topics
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish_score(&self, update: &ScoreUpdate) -> Result<(), PublishError>;

    async fn publish_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), PublishError>;
}

/// Publishes envelopes to the bridge webhook over HTTP
pub struct HttpPublisher {
    client: reqwest::Client,
    events_url: String,
    max_attempts: u32,
}

impl HttpPublisher {
    pub fn new(bridge_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            events_url: format!("{}/events", bridge_url.trim_end_matches('/')),
            max_attempts: 3,
        }
    }

    /// Deliver one envelope, honoring the acknowledgment contract:
    /// `retry` acks are retried after the Retry-After hint, `failure`
    /// acks abort immediately.
    async fn deliver(&self, envelope: serde_json::Value) -> Result<(), PublishError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .post(&self.events_url)
                .json(&envelope)
                .send()
                .await;

            let retry_after = match response {
                Ok(resp) => {
                    let hint = retry_after_hint(&resp);
                    match resp.json::<Acknowledgment>().await {
                        Ok(ack) => match ack.status {
                            AckStatus::Success => {
                                debug!(
                                    correlation_id = %ack.correlation_id,
                                    delivered = ack.routing.as_ref().map(|r| r.delivered),
                                    "Publish acknowledged"
                                );
                                return Ok(());
                            }
                            AckStatus::Failure => {
                                return Err(PublishError::Rejected(format!(
                                    "bridge rejected event {}",
                                    ack.event_id
                                )));
                            }
                            AckStatus::Retry => hint,
                        },
                        Err(e) => {
                            warn!("Unreadable acknowledgment: {}", e);
                            None
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt, "Publish attempt failed: {}", e);
                    None
                }
            };

            if attempt >= self.max_attempts {
                return Err(PublishError::RetriesExhausted { attempts: attempt });
            }
            let backoff =
                retry_after.unwrap_or_else(|| Duration::from_millis(200 * 2u64.pow(attempt - 1)));
            tokio::time::sleep(backoff).await;
        }
    }
}

fn retry_after_hint(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl ResultPublisher for HttpPublisher {
    async fn publish_score(&self, update: &ScoreUpdate) -> Result<(), PublishError> {
        let envelope = json!({
            "id": Uuid::new_v4().to_string(),
            "type": "score.updated",
            "source": "mpp-ingest",
            "specversion": "1.0",
            "data": update,
        });
        self.deliver(envelope).await
    }

    async fn publish_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), PublishError> {
        let envelope = json!({
            "id": entry.entry_id.to_string(),
            "type": "pipeline.dead-letter",
            "source": "mpp-ingest",
            "specversion": "1.0",
            "data": entry,
        });
        self.deliver(envelope).await
    }
}

/// Publisher that drops everything; for setups without a bridge
pub struct NoopPublisher;

#[async_trait]
impl ResultPublisher for NoopPublisher {
    async fn publish_score(&self, _update: &ScoreUpdate) -> Result<(), PublishError> {
        Ok(())
    }

    async fn publish_dead_letter(&self, _entry: &DeadLetterEntry) -> Result<(), PublishError> {
        Ok(())
    }
}
