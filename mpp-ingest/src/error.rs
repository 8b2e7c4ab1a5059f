//! Error taxonomy for the ingestor
//!
//! Classification drives retry behavior: `Invalid` is bounced to the
//! caller and never retried, `Transient` gets the bounded backoff loop,
//! `Permanent` goes straight to the dead-letter store.

use thiserror::Error;

/// Ingest pipeline errors
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed event; never retried, bounced to the caller
    #[error("Invalid event: {0}")]
    Invalid(String),

    /// Store or broker unavailable; retried with bounded backoff
    #[error("Transient error: {0}")]
    Transient(String),

    /// Unrecoverable processing fault; dead-lettered
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Lane plumbing failure (worker gone, channel closed)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Stable kind string for dead-letter entries and logs
    pub fn kind_str(&self) -> &'static str {
        match self {
            IngestError::Invalid(_) => "validation",
            IngestError::Transient(_) => "transient",
            IngestError::Permanent(_) => "permanent",
            IngestError::Internal(_) => "internal",
        }
    }

    /// Whether the bounded retry loop applies
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }
}

/// Convenience Result type using IngestError
pub type Result<T> = std::result::Result<T, IngestError>;
