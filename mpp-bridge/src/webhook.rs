//! Inbound webhook: POST /events
//!
//! Accepts result envelopes from the ingestor (or any upstream system
//! speaking the same shape), classifies them, fans them out through the
//! connection registry, and answers with the acknowledgment contract.
//!
//! Ack semantics:
//! - `success`: event accepted and routed; zero matching connections is
//!   still success, with `routing.delivered` = 0
//! - `failure`: malformed envelope; the sender must not retry.
//!   Returned with HTTP 200 so naive retry-on-non-2xx senders do not
//!   redeliver a permanently bad event
//! - `retry`: transient internal fault; HTTP 503 with a Retry-After
//!   hint

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

use mpp_common::events::{
    Acknowledgment, ResultEnvelope, RoutingInfo, TOPIC_DEAD_LETTER, TOPIC_SCORE_UPDATED,
};

use crate::classify::classify;
use crate::AppState;

/// Map an envelope kind to its push topic
///
/// Known pipeline kinds get their canonical topic; anything else passes
/// through as-is so third-party kinds can be subscribed to directly.
fn topic_for(kind: &str) -> &str {
    match kind {
        "score.updated" => TOPIC_SCORE_UPDATED,
        "pipeline.dead-letter" => TOPIC_DEAD_LETTER,
        other => other,
    }
}

/// POST /events - receive and route one event
pub async fn receive_event(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let started = Instant::now();

    let envelope = match ResultEnvelope::parse(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            let event_id = body
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            warn!(event_id, "Rejected malformed envelope: {}", e);
            let ack = Acknowledgment::failure(event_id, elapsed_ms(started));
            return (StatusCode::OK, Json(ack)).into_response();
        }
    };

    let topic = topic_for(&envelope.kind).to_string();
    let priority = classify(&envelope.data);
    let scope = envelope.data.get("subject_id").and_then(|v| v.as_str());

    match state.registry.route(&topic, scope, priority, &envelope.data) {
        Ok(delivered) => {
            info!(
                event_id = %envelope.id,
                topic,
                delivered,
                %priority,
                "Event routed"
            );
            let ack = Acknowledgment::success(
                &envelope.id,
                elapsed_ms(started),
                RoutingInfo {
                    topic,
                    delivered,
                    priority,
                },
            );
            (StatusCode::OK, Json(ack)).into_response()
        }
        Err(e) => {
            warn!(event_id = %envelope.id, "Routing failed: {}", e);
            let ack = Acknowledgment::retry(&envelope.id, elapsed_ms(started));
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("Retry-After", "1")],
                Json(ack),
            )
                .into_response()
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_mapping() {
        assert_eq!(topic_for("score.updated"), TOPIC_SCORE_UPDATED);
        assert_eq!(topic_for("pipeline.dead-letter"), TOPIC_DEAD_LETTER);
        assert_eq!(topic_for("custom.kind"), "custom.kind");
    }
}
