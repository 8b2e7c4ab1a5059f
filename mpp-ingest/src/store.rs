//! State store manager
//!
//! Keyed persistent store over the `state_entries` table. All writes for
//! one logical subject update happen in a single SQLite transaction:
//! current pointer, dated snapshot, per-component values, prediction,
//! and (when processing an event) the idempotency record. Readers never
//! observe a partially applied update.
//!
//! Key layout and TTL classes come from `mpp_common::keys`.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use mpp_common::events::ActivityEvent;
use mpp_common::keys::{self, TtlClass};
use mpp_common::score::ScoreResult;

/// Prediction window written alongside each commit
const PREDICTION_WINDOW: &str = "7d";

/// State store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another writer updated the subject's current pointer
    #[error("Version conflict for subject {subject_id}: expected version {expected}")]
    VersionConflict { subject_id: String, expected: i64 },
}

/// Proof that an event was already processed, stored under
/// `processed:{event_id}` with the dedup TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub event_id: Uuid,
    pub processed_at: chrono::DateTime<Utc>,
    pub outcome: String,
}

/// Keyed state store with multi-key transactional writes
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Commit one subject update as a single atomic transaction
    ///
    /// Bumps the per-subject version (optimistic concurrency) and
    /// returns the stored result. Deterministic for the same input:
    /// a replayed event that slipped past the dedup check rewrites the
    /// same snapshot keys with the same values.
    pub async fn commit(&self, result: &ScoreResult) -> Result<ScoreResult, StoreError> {
        self.commit_with_event(result, None).await
    }

    /// Commit an update and, in the same transaction, write the
    /// idempotency record for the event that caused it
    pub async fn commit_with_event(
        &self,
        result: &ScoreResult,
        processed: Option<&ActivityEvent>,
    ) -> Result<ScoreResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        let stored = Self::apply_update(&mut tx, result).await?;

        if let Some(event) = processed {
            let record = ProcessingRecord {
                event_id: event.event_id,
                processed_at: stored.computed_at,
                outcome: "processed".to_string(),
            };
            let expires = expires_at(TtlClass::ProcessingRecord);
            put_entry(
                &mut tx,
                &keys::processed(&event.event_id),
                None,
                &serde_json::to_string(&record)?,
                expires,
            )
            .await?;
        }

        tx.commit().await?;
        debug!(
            subject_id = %stored.subject_id,
            version = stored.version,
            "Committed score update"
        );
        Ok(stored)
    }

    /// All writes for one subject update, inside the caller's transaction
    async fn apply_update(
        tx: &mut Transaction<'_, Sqlite>,
        result: &ScoreResult,
    ) -> Result<ScoreResult, StoreError> {
        let subject = result.subject_id.as_str();
        let prev = read_current_tx(tx, subject).await?;

        let mut stored = result.clone();
        stored.version = prev.as_ref().map(|p| p.version + 1).unwrap_or(1);

        let expected = prev.as_ref().map(|p| p.version);
        write_current(tx, &stored, expected).await?;

        // Dated snapshot plus per-component values, retention TTL
        let date = stored.computed_at.date_naive();
        let snapshot_expires = expires_at(TtlClass::Snapshot);
        put_entry(
            tx,
            &keys::snapshot(subject, date),
            Some(subject),
            &serde_json::to_string(&stored)?,
            snapshot_expires,
        )
        .await?;

        for (component, value) in stored.components.iter() {
            put_entry(
                tx,
                &keys::snapshot_component(subject, date, component),
                Some(subject),
                &value.to_string(),
                snapshot_expires,
            )
            .await?;
        }

        // Short-lived trajectory prediction: linear extrapolation of the
        // composite from the previous result, clamped to [0,1]
        let projected = match &prev {
            Some(p) => {
                (stored.composite_score + (stored.composite_score - p.composite_score))
                    .clamp(0.0, 1.0)
            }
            None => stored.composite_score,
        };
        put_entry(
            tx,
            &keys::prediction(subject, PREDICTION_WINDOW),
            Some(subject),
            &json!({
                "window": PREDICTION_WINDOW,
                "projected_composite": projected,
                "base_version": stored.version,
            })
            .to_string(),
            expires_at(TtlClass::Prediction),
        )
        .await?;

        Ok(stored)
    }

    /// Current score for a subject, if any
    pub async fn read_current(&self, subject_id: &str) -> Result<Option<ScoreResult>, StoreError> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM state_entries WHERE key = ? \
             AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(keys::current(subject_id))
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    /// Dated snapshots for a subject within an optional date range,
    /// oldest first
    pub async fn read_history(
        &self,
        subject_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<ScoreResult>, StoreError> {
        // Snapshot keys end in a yyyy-mm-dd date; the per-component keys
        // carry a further suffix and don't match this pattern. The
        // subject_id equality keeps `_`/`%` in a subject id from acting
        // as LIKE wildcards and matching other subjects' keys.
        let pattern = format!("{}:snapshot:____-__-__", subject_id);
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT value FROM state_entries WHERE subject_id = ? AND key LIKE ? \
             AND (expires_at IS NULL OR expires_at > ?) ORDER BY key",
        )
        .bind(subject_id)
        .bind(pattern)
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for value in rows {
            let result: ScoreResult = serde_json::from_str(&value)?;
            let date = result.computed_at.date_naive();
            if from.is_some_and(|f| date < f) || to.is_some_and(|t| date > t) {
                continue;
            }
            history.push(result);
        }
        Ok(history)
    }

    /// Bulk read of current scores, preserving input order
    pub async fn read_bulk(
        &self,
        subject_ids: &[String],
    ) -> Result<Vec<(String, Option<ScoreResult>)>, StoreError> {
        if subject_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT key, value FROM state_entries WHERE key IN (");
        let mut separated = qb.separated(", ");
        for subject in subject_ids {
            separated.push_bind(keys::current(subject));
        }
        qb.push(") AND (expires_at IS NULL OR expires_at > ");
        qb.push_bind(Utc::now().timestamp());
        qb.push(")");

        let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut by_key = std::collections::HashMap::new();
        for (key, value) in rows {
            by_key.insert(key, value);
        }

        let mut out = Vec::with_capacity(subject_ids.len());
        for subject in subject_ids {
            let result = match by_key.get(&keys::current(subject)) {
                Some(v) => Some(serde_json::from_str(v)?),
                None => None,
            };
            out.push((subject.clone(), result));
        }
        Ok(out)
    }

    /// Bulk commit: each subject's update is independently atomic,
    /// deliberately NOT one transaction across subjects. Fails fast;
    /// updates already committed stay committed.
    pub async fn commit_bulk(&self, results: &[ScoreResult]) -> Result<usize, StoreError> {
        let mut committed = 0;
        for result in results {
            self.commit(result).await?;
            committed += 1;
        }
        Ok(committed)
    }

    /// Whether a fresh idempotency record exists for this event
    pub async fn is_processed(&self, event_id: &Uuid) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM state_entries WHERE key = ? \
             AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(keys::processed(event_id))
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Remove expired rows; run periodically by the sweeper task
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM state_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Absolute expiry timestamp for a TTL class
fn expires_at(class: TtlClass) -> Option<i64> {
    class.ttl().map(|ttl| (Utc::now() + ttl).timestamp())
}

/// Upsert one state entry inside a transaction
async fn put_entry(
    tx: &mut Transaction<'_, Sqlite>,
    key: &str,
    subject_id: Option<&str>,
    value: &str,
    expires: Option<i64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO state_entries (key, subject_id, value, expires_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            expires_at = excluded.expires_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(subject_id)
    .bind(value)
    .bind(expires)
    .bind(Utc::now().timestamp())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Read the current pointer inside a transaction
async fn read_current_tx(
    tx: &mut Transaction<'_, Sqlite>,
    subject_id: &str,
) -> Result<Option<ScoreResult>, StoreError> {
    let value: Option<String> = sqlx::query_scalar(
        "SELECT value FROM state_entries WHERE key = ? \
         AND (expires_at IS NULL OR expires_at > ?)",
    )
    .bind(keys::current(subject_id))
    .bind(Utc::now().timestamp())
    .fetch_optional(&mut **tx)
    .await?;

    match value {
        Some(v) => Ok(Some(serde_json::from_str(&v)?)),
        None => Ok(None),
    }
}

/// Write the current pointer, guarded by the expected version
///
/// The guard makes the single-writer assumption explicit: a concurrent
/// writer that bumped the version since our read loses us the update
/// and the commit is retried from scratch.
async fn write_current(
    tx: &mut Transaction<'_, Sqlite>,
    stored: &ScoreResult,
    expected_version: Option<i64>,
) -> Result<(), StoreError> {
    let subject = stored.subject_id.as_str();
    let value = serde_json::to_string(stored)?;
    let now = Utc::now().timestamp();

    let rows = match expected_version {
        Some(expected) => {
            sqlx::query(
                "UPDATE state_entries SET value = ?, updated_at = ? \
                 WHERE key = ? AND json_extract(value, '$.version') = ?",
            )
            .bind(&value)
            .bind(now)
            .bind(keys::current(subject))
            .bind(expected)
            .execute(&mut **tx)
            .await?
            .rows_affected()
        }
        None => {
            sqlx::query(
                "INSERT INTO state_entries (key, subject_id, value, expires_at, updated_at) \
                 VALUES (?, ?, ?, NULL, ?) ON CONFLICT(key) DO NOTHING",
            )
            .bind(keys::current(subject))
            .bind(subject)
            .bind(&value)
            .bind(now)
            .execute(&mut **tx)
            .await?
            .rows_affected()
        }
    };

    if rows == 0 {
        return Err(StoreError::VersionConflict {
            subject_id: subject.to_string(),
            expected: expected_version.unwrap_or(0),
        });
    }
    Ok(())
}
