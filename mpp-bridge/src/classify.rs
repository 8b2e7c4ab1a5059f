//! Priority classification for routed events
//!
//! An explicit `priority` field in the envelope data is authoritative.
//! Without one, a keyword scan over the textual fields picks a tier so
//! clients can still triage; anything unrecognized is Normal.

use serde_json::Value;

use mpp_common::events::Priority;

const CRITICAL_KEYWORDS: &[&str] = &["urgent", "critical", "failed", "blocked"];
const HIGH_KEYWORDS: &[&str] = &["overdue", "deadline", "regression", "declined"];
const LOW_KEYWORDS: &[&str] = &["digest", "summary", "fyi"];

/// Classify an envelope's data payload into a priority tier
pub fn classify(data: &Value) -> Priority {
    if let Some(explicit) = data
        .get("priority")
        .and_then(|v| v.as_str())
        .and_then(Priority::from_field)
    {
        return explicit;
    }

    let haystack = collect_text(data).to_ascii_lowercase();
    if contains_any(&haystack, CRITICAL_KEYWORDS) {
        Priority::Critical
    } else if contains_any(&haystack, HIGH_KEYWORDS) {
        Priority::High
    } else if contains_any(&haystack, LOW_KEYWORDS) {
        Priority::Low
    } else {
        Priority::Normal
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Concatenate the top-level string fields of the payload
///
/// Only one level deep: nested structures carry data, not signals.
fn collect_text(data: &Value) -> String {
    match data.as_object() {
        Some(obj) => obj
            .values()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        None => data.as_str().unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_explicit_priority_wins() {
        let data = json!({"priority": "low", "message": "URGENT: system failure"});
        assert_eq!(classify(&data), Priority::Low);
    }

    #[test]
    fn test_urgent_maps_to_critical() {
        let data = json!({"priority": "urgent"});
        assert_eq!(classify(&data), Priority::Critical);

        let data = json!({"message": "urgent review needed"});
        assert_eq!(classify(&data), Priority::Critical);
    }

    #[test]
    fn test_keyword_tiers() {
        assert_eq!(
            classify(&json!({"note": "assessment overdue"})),
            Priority::High
        );
        assert_eq!(classify(&json!({"note": "weekly digest"})), Priority::Low);
        assert_eq!(
            classify(&json!({"note": "score recalculated"})),
            Priority::Normal
        );
    }

    #[test]
    fn test_unknown_explicit_falls_back_to_scan() {
        let data = json!({"priority": "whenever", "note": "deadline tomorrow"});
        assert_eq!(classify(&data), Priority::High);
    }

    #[test]
    fn test_non_object_data() {
        assert_eq!(classify(&json!("plain critical text")), Priority::Critical);
        assert_eq!(classify(&json!(42)), Priority::Normal);
    }
}
