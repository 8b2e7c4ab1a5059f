//! Dead-letter store
//!
//! Captures events that exhausted the ingestor's retry budget. Entries
//! keep the full original event so a replay re-enters the pipeline as
//! if newly arrived, subject to the same dedup check. Retention is the
//! review window from the key registry; entries are never auto-deleted
//! before it elapses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use mpp_common::events::ActivityEvent;
use mpp_common::keys::DEAD_LETTER_RETENTION_DAYS;

/// Dead-letter store errors
#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dead-letter entry not found: {0}")]
    NotFound(Uuid),
}

/// A captured failed event, pending manual inspection or replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry_id: Uuid,
    pub event_id: Uuid,
    pub original_kind: String,
    /// Full original event, replayable as-is
    pub payload: serde_json::Value,
    pub error_kind: String,
    pub error_detail: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl DeadLetterEntry {
    /// Reconstruct the original event for replay
    pub fn original_event(&self) -> Result<ActivityEvent, DeadLetterError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Dead-letter store over the `dead_letters` table
#[derive(Clone)]
pub struct DeadLetterStore {
    pool: SqlitePool,
}

impl DeadLetterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Capture a failed event with the error that killed it
    pub async fn capture(
        &self,
        event: &ActivityEvent,
        error_kind: &str,
        error_detail: &str,
        retry_count: u32,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let entry = DeadLetterEntry {
            entry_id: Uuid::new_v4(),
            event_id: event.event_id,
            original_kind: event.kind.as_str().to_string(),
            payload: serde_json::to_value(event)?,
            error_kind: error_kind.to_string(),
            error_detail: Some(error_detail.to_string()),
            failed_at: Utc::now(),
            retry_count,
        };

        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (entry_id, event_id, original_kind, payload, error_kind,
                 error_detail, failed_at, retry_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.entry_id.to_string())
        .bind(entry.event_id.to_string())
        .bind(&entry.original_kind)
        .bind(entry.payload.to_string())
        .bind(&entry.error_kind)
        .bind(&entry.error_detail)
        .bind(entry.failed_at.timestamp())
        .bind(entry.retry_count as i64)
        .execute(&self.pool)
        .await?;

        warn!(
            event_id = %entry.event_id,
            error_kind = %entry.error_kind,
            retry_count = entry.retry_count,
            "Captured dead-letter entry"
        );
        Ok(entry)
    }

    /// Most recent entries first
    pub async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            "SELECT entry_id, event_id, original_kind, payload, error_kind, \
             error_detail, failed_at, retry_count \
             FROM dead_letters ORDER BY failed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterRow::into_entry).collect()
    }

    pub async fn get(&self, entry_id: &Uuid) -> Result<DeadLetterEntry, DeadLetterError> {
        let row: Option<DeadLetterRow> = sqlx::query_as(
            "SELECT entry_id, event_id, original_kind, payload, error_kind, \
             error_detail, failed_at, retry_count \
             FROM dead_letters WHERE entry_id = ?",
        )
        .bind(entry_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeadLetterRow::into_entry)
            .transpose()?
            .ok_or(DeadLetterError::NotFound(*entry_id))
    }

    /// Remove only entries older than the review window
    pub async fn purge_reviewed(&self) -> Result<u64, DeadLetterError> {
        let cutoff = (Utc::now() - chrono::Duration::days(DEAD_LETTER_RETENTION_DAYS)).timestamp();
        let result = sqlx::query("DELETE FROM dead_letters WHERE failed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!(purged = result.rows_affected(), "Purged reviewed dead letters");
        }
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, DeadLetterError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?)
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    entry_id: String,
    event_id: String,
    original_kind: String,
    payload: String,
    error_kind: String,
    error_detail: Option<String>,
    failed_at: i64,
    retry_count: i64,
}

impl DeadLetterRow {
    fn into_entry(self) -> Result<DeadLetterEntry, DeadLetterError> {
        Ok(DeadLetterEntry {
            entry_id: Uuid::parse_str(&self.entry_id)
                .map_err(|_| DeadLetterError::NotFound(Uuid::nil()))?,
            event_id: Uuid::parse_str(&self.event_id).unwrap_or_else(|_| Uuid::nil()),
            original_kind: self.original_kind,
            payload: serde_json::from_str(&self.payload)?,
            error_kind: self.error_kind,
            error_detail: self.error_detail,
            failed_at: DateTime::from_timestamp(self.failed_at, 0).unwrap_or_else(Utc::now),
            retry_count: self.retry_count as u32,
        })
    }
}
