//! Database initialization
//!
//! Creates the pipeline database on first run and brings the schema up
//! idempotently on every start. Both services share one schema; the
//! ingestor is the only writer of `state_entries` and `dead_letters`.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize the database connection pool and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers while one lane writer commits
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_tables(&pool).await?;

    Ok(pool)
}

/// Create the pipeline schema (idempotent, safe to call on every start)
///
/// Also used directly by tests against `sqlite::memory:` pools.
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    // Keyed state store. `expires_at` is unix seconds; NULL = no TTL.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS state_entries (
            key TEXT PRIMARY KEY,
            subject_id TEXT,
            value TEXT NOT NULL,
            expires_at INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_state_entries_subject ON state_entries(subject_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_state_entries_expires ON state_entries(expires_at)",
    )
    .execute(pool)
    .await?;

    // Dead-letter store for events that exhausted their retry budget
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            entry_id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            original_kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            error_kind TEXT NOT NULL,
            error_detail TEXT,
            failed_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON dead_letters(failed_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
