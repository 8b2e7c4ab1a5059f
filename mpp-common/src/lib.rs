//! Shared types and utilities for MPP microservices
//!
//! Event schema, score domain, state-key registry, and common
//! infrastructure (errors, config, database, SSE) used by the
//! ingestor (mpp-ingest) and the event bridge (mpp-bridge).

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod keys;
pub mod score;
pub mod sse;

pub use error::{Error, Result};
