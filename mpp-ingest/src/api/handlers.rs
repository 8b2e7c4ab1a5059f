//! HTTP handlers for the ingestor API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::Json,
};
use chrono::NaiveDate;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tracing::error;
use uuid::Uuid;

use mpp_common::events::ActivityEvent;

use super::AppState;
use crate::error::IngestError;

/// Health check endpoint
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "module": "mpp-ingest",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /ingest - submit one activity event
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<ActivityEvent>,
) -> (StatusCode, Json<Value>) {
    let event_id = event.event_id;
    match state.engine.ingest(event).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "event_id": event_id,
                "outcome": outcome.as_str(),
            })),
        ),
        Err(e) => error_response(e),
    }
}

/// GET /subjects/:subject_id/current
pub async fn get_current(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.store.read_current(&subject_id).await {
        Ok(Some(result)) => (StatusCode::OK, Json(json!(result))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no score for subject {}", subject_id) })),
        ),
        Err(e) => {
            error!("read_current failed: {}", e);
            internal_error()
        }
    }
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// GET /subjects/:subject_id/history?from=&to=
pub async fn get_history(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> (StatusCode, Json<Value>) {
    match state
        .store
        .read_history(&subject_id, params.from, params.to)
        .await
    {
        Ok(history) => (
            StatusCode::OK,
            Json(json!({
                "subject_id": subject_id,
                "count": history.len(),
                "history": history,
            })),
        ),
        Err(e) => {
            error!("read_history failed: {}", e);
            internal_error()
        }
    }
}

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// GET /dead-letters
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> (StatusCode, Json<Value>) {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    match state.dead_letters.list(limit).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(json!({
                "count": entries.len(),
                "entries": entries,
            })),
        ),
        Err(e) => {
            error!("dead-letter list failed: {}", e);
            internal_error()
        }
    }
}

/// POST /dead-letters/:entry_id/replay
///
/// Re-injects the original event as if newly arrived; the usual dedup
/// check applies.
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
) -> (StatusCode, Json<Value>) {
    let entry = match state.dead_letters.get(&entry_id).await {
        Ok(entry) => entry,
        Err(crate::dead_letter::DeadLetterError::NotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("dead-letter entry {} not found", entry_id) })),
            );
        }
        Err(e) => {
            error!("dead-letter get failed: {}", e);
            return internal_error();
        }
    };

    let event = match entry.original_event() {
        Ok(event) => event,
        Err(e) => {
            error!("dead-letter payload unreadable: {}", e);
            return internal_error();
        }
    };

    match state.engine.ingest(event).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "entry_id": entry_id,
                "event_id": entry.event_id,
                "outcome": outcome.as_str(),
            })),
        ),
        Err(e) => error_response(e),
    }
}

/// GET /events - heartbeat-only status stream
pub async fn event_stream() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    mpp_common::sse::create_heartbeat_sse_stream("mpp-ingest")
}

fn error_response(err: IngestError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        IngestError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("ingest failed: {}", err);
    }
    (status, Json(json!({ "error": err.to_string() })))
}

fn internal_error() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
}
