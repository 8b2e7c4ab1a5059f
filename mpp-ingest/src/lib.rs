//! mpp-ingest library - Idempotent Ingestor service
//!
//! Consumes learning-activity events, deduplicates by event id,
//! computes the mastery score, commits it atomically to the keyed
//! state store, and publishes the result toward the bridge.

pub mod api;
pub mod dead_letter;
pub mod error;
pub mod ingest;
pub mod publisher;
pub mod store;

pub use api::{build_router, AppState};
pub use error::IngestError;
pub use ingest::{IngestConfig, IngestEngine, Outcome};
