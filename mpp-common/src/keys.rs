//! State-key registry and TTL table
//!
//! Every key class in the state store is declared here so the layout
//! and retention policy live in one place:
//!
//! - `{subject}:current` — current score pointer, no TTL
//! - `{subject}:snapshot:{date}` — dated result snapshot
//! - `{subject}:snapshot:{date}:{component}` — per-component snapshot value
//! - `{subject}:prediction:{window}` — ephemeral derived value
//! - `processed:{event_id}` — idempotency record

use chrono::{Duration, NaiveDate};
use uuid::Uuid;

use crate::score::Component;

/// Idempotency records expire after this window; a replay of the same
/// event_id past it is reprocessed as new (documented risk).
pub const DEDUP_TTL_DAYS: i64 = 7;

/// Dated snapshots are kept for the data-retention window
pub const SNAPSHOT_RETENTION_DAYS: i64 = 30;

/// Predictions are cheap to recompute and short-lived
pub const PREDICTION_TTL_HOURS: i64 = 6;

/// Dead-letter entries are reviewable for this many days and never
/// auto-deleted earlier
pub const DEAD_LETTER_RETENTION_DAYS: i64 = 30;

/// TTL class of a state key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Overwritten in place, never expires
    Current,
    /// Expires per data-retention policy
    Snapshot,
    /// Ephemeral derived value
    Prediction,
    /// Idempotency record, shorter than the snapshot window
    ProcessingRecord,
}

impl TtlClass {
    /// Time-to-live for this class; `None` means no expiry
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            TtlClass::Current => None,
            TtlClass::Snapshot => Some(Duration::days(SNAPSHOT_RETENTION_DAYS)),
            TtlClass::Prediction => Some(Duration::hours(PREDICTION_TTL_HOURS)),
            TtlClass::ProcessingRecord => Some(Duration::days(DEDUP_TTL_DAYS)),
        }
    }
}

/// `{subject}:current`
pub fn current(subject_id: &str) -> String {
    format!("{}:current", subject_id)
}

/// `{subject}:snapshot:{date}`
pub fn snapshot(subject_id: &str, date: NaiveDate) -> String {
    format!("{}:snapshot:{}", subject_id, date)
}

/// `{subject}:snapshot:{date}:{component}`
pub fn snapshot_component(subject_id: &str, date: NaiveDate, component: Component) -> String {
    format!("{}:snapshot:{}:{}", subject_id, date, component.as_str())
}

/// Prefix matching all dated snapshots for a subject (not the
/// per-component keys, which carry a further suffix)
pub fn snapshot_prefix(subject_id: &str) -> String {
    format!("{}:snapshot:", subject_id)
}

/// `{subject}:prediction:{window}`
pub fn prediction(subject_id: &str, window: &str) -> String {
    format!("{}:prediction:{}", subject_id, window)
}

/// `processed:{event_id}`
pub fn processed(event_id: &Uuid) -> String {
    format!("processed:{}", event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        assert_eq!(current("learner-1"), "learner-1:current");
        assert_eq!(snapshot("learner-1", date), "learner-1:snapshot:2026-03-14");
        assert_eq!(
            snapshot_component("learner-1", date, Component::Quality),
            "learner-1:snapshot:2026-03-14:quality"
        );
        assert_eq!(prediction("learner-1", "7d"), "learner-1:prediction:7d");

        let id = Uuid::nil();
        assert_eq!(
            processed(&id),
            "processed:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_snapshot_prefix_matches_snapshot_keys() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let prefix = snapshot_prefix("s1");
        assert!(snapshot("s1", date).starts_with(&prefix));
        assert!(snapshot_component("s1", date, Component::Completion).starts_with(&prefix));
        assert!(!current("s1").starts_with(&prefix));
    }

    #[test]
    fn test_ttl_classes() {
        assert_eq!(TtlClass::Current.ttl(), None);
        assert_eq!(TtlClass::Snapshot.ttl(), Some(Duration::days(30)));
        assert_eq!(TtlClass::Prediction.ttl(), Some(Duration::hours(6)));
        assert_eq!(TtlClass::ProcessingRecord.ttl(), Some(Duration::days(7)));

        // The dedup window is strictly shorter than snapshot retention
        assert!(
            TtlClass::ProcessingRecord.ttl().unwrap() < TtlClass::Snapshot.ttl().unwrap()
        );
    }
}
