//! Client-facing push streams
//!
//! GET /stream opens an SSE connection registered with the fan-out
//! router; DELETE /connections/:id closes one from the server side.
//! Each stream drains its registry channel: routed events become named
//! SSE events, pings become comments, and a closed channel ends the
//! stream.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use mpp_common::events::{TOPIC_DEAD_LETTER, TOPIC_SCORE_UPDATED};

use crate::registry::{ConnectionRegistry, PushFrame};
use crate::AppState;

/// Unregisters the connection when its stream is dropped
///
/// Clients that vanish without a DELETE leave the topic indices clean
/// as soon as axum drops the response body, instead of waiting for the
/// next failed write or heartbeat sweep.
struct StreamGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: Uuid,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Ok(true) = self.registry.unregister(&self.connection_id) {
            info!(connection_id = %self.connection_id, "Push stream dropped, connection removed");
        }
    }
}

/// Query parameters for GET /stream
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Restrict the stream to one subject's events
    pub subject_id: Option<String>,
    /// Comma-separated topic list; defaults to the pipeline topics
    pub topics: Option<String>,
}

fn parse_topics(raw: Option<&str>) -> HashSet<String> {
    match raw {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        None => [TOPIC_SCORE_UPDATED, TOPIC_DEAD_LETTER]
            .iter()
            .map(|t| t.to_string())
            .collect(),
    }
}

/// GET /stream - open a filtered push stream
pub async fn open_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let topics = parse_topics(params.topics.as_deref());
    if topics.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (connection_id, mut rx) = state
        .registry
        .register(params.subject_id.clone(), topics)
        .map_err(|e| {
            warn!("Could not register push connection: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    info!(
        connection_id = %connection_id,
        subject_id = ?params.subject_id,
        "Push stream opened"
    );

    let guard = StreamGuard {
        registry: state.registry.clone(),
        connection_id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;


        yield Ok(Event::default()
            .event("Connected")
            .data(json!({"connection_id": connection_id}).to_string()));

        while let Some(frame) = rx.recv().await {
            match frame {
                PushFrame::Event { topic, priority, data } => {
                    let body = json!({
                        "topic": topic,
                        "priority": priority,
                        "data": data,
                    });
                    yield Ok(Event::default().event(topic).data(body.to_string()));
                }
                PushFrame::Ping => {
                    yield Ok(Event::default().comment("heartbeat"));
                }
            }
        }
        // Sender dropped: registry closed this connection
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

/// DELETE /connections/:id - close a push connection
pub async fn close_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> impl IntoResponse {
    // Orderly teardown: stop routing to it first, then drop the
    // transport so the client's stream ends
    let known = state
        .registry
        .begin_close(&connection_id)
        .and_then(|_| state.registry.unregister(&connection_id));

    match known {
        Ok(true) => {
            info!(connection_id = %connection_id, "Push connection closed by request");
            (
                StatusCode::OK,
                Json(json!({"connection_id": connection_id, "status": "closed"})),
            )
                .into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown connection"})),
        )
            .into_response(),
        Err(e) => {
            warn!("Could not close connection: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topics() {
        let topics = parse_topics(None);
        assert!(topics.contains(TOPIC_SCORE_UPDATED));
        assert!(topics.contains(TOPIC_DEAD_LETTER));
        assert_eq!(topics.len(), 2);
    }

    #[test]
    fn test_explicit_topic_list() {
        let topics = parse_topics(Some("score-updated, custom.kind"));
        assert!(topics.contains("score-updated"));
        assert!(topics.contains("custom.kind"));
        assert_eq!(topics.len(), 2);
    }

    #[test]
    fn test_blank_topic_list_is_empty() {
        assert!(parse_topics(Some(" , ")).is_empty());
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let (connection_id, _rx) = registry
            .register(None, [TOPIC_SCORE_UPDATED.to_string()].into())
            .unwrap();
        assert_eq!(registry.status().unwrap().0, 1);

        drop(StreamGuard {
            registry: registry.clone(),
            connection_id,
        });

        assert_eq!(registry.status().unwrap().0, 0);
        assert!(!registry
            .status()
            .unwrap()
            .1
            .contains_key(TOPIC_SCORE_UPDATED));
    }
}
