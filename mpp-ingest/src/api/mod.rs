//! HTTP API for the ingestor
//!
//! `POST /ingest` stands in for the broker-delivered activity topic:
//! the producer side is at-least-once, the engine behind it makes
//! delivery effectively at-most-once.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::dead_letter::DeadLetterStore;
use crate::ingest::IngestEngine;
use crate::store::StateStore;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<IngestEngine>,
    pub store: StateStore,
    pub dead_letters: DeadLetterStore,
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(handlers::ingest_event))
        .route("/subjects/:subject_id/current", get(handlers::get_current))
        .route("/subjects/:subject_id/history", get(handlers::get_history))
        .route("/dead-letters", get(handlers::list_dead_letters))
        .route(
            "/dead-letters/:entry_id/replay",
            post(handlers::replay_dead_letter),
        )
        .route("/health", get(handlers::health))
        .route("/events", get(handlers::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
