//! mpp-bridge library - Event Bridge service
//!
//! Receives result envelopes over an inbound webhook, classifies them,
//! and fans them out to subscribed push connections with topic and
//! subject filtering. The acknowledgment returned to the sender closes
//! the delivery loop: success, failure (never retry), or retry.

pub mod classify;
pub mod registry;
pub mod stream;
pub mod webhook;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use registry::ConnectionRegistry;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(webhook::receive_event))
        .route("/stream", get(stream::open_stream))
        .route("/connections/:connection_id", delete(stream::close_connection))
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - liveness check
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "module": "mpp-bridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /status - connection and subscription counts
async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let (connections, topics) = state
        .registry
        .status()
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({
        "connections": connections,
        "topics": topics,
    })))
}
