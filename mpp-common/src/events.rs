//! Event schema for the MPP pipeline
//!
//! Shared vocabulary for all pipeline stages: inbound activity events,
//! the webhook envelope delivered to the bridge, the acknowledgment
//! contract returned to the delivering system, and the outbound
//! score-update message pushed to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::score::ScoreResult;
use crate::{Error, Result};

/// Topic carried by score-update push events
pub const TOPIC_SCORE_UPDATED: &str = "score-updated";

/// Topic carried by dead-letter notifications
pub const TOPIC_DEAD_LETTER: &str = "dead-letter";

/// Kinds of learning-activity events accepted by the ingestor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Learner finished a lesson or unit
    LessonCompleted,
    /// Learner submitted a graded assessment
    AssessmentSubmitted,
    /// Reviewer scored a submitted project
    ProjectReviewed,
    /// Learner logged a practice session
    PracticeLogged,
}

impl ActivityKind {
    /// Kind as a stable string for storage and logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::LessonCompleted => "lesson_completed",
            ActivityKind::AssessmentSubmitted => "assessment_submitted",
            ActivityKind::ProjectReviewed => "project_reviewed",
            ActivityKind::PracticeLogged => "practice_logged",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A learning-activity event, immutable once emitted
///
/// `event_id` is globally unique and is the deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub event_id: Uuid,
    pub kind: ActivityKind,
    pub occurred_at: DateTime<Utc>,
    pub subject_id: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, Value>,
    pub source: String,
}

impl ActivityEvent {
    /// Schema validation beyond what deserialization enforces
    ///
    /// Rejected events are never retried.
    pub fn validate(&self) -> Result<()> {
        if self.event_id.is_nil() {
            return Err(Error::InvalidInput("event_id must not be nil".into()));
        }
        if self.subject_id.trim().is_empty() {
            return Err(Error::InvalidInput("subject_id must not be empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(Error::InvalidInput("source must not be empty".into()));
        }
        Ok(())
    }
}

/// Advisory priority attached to routed events for client-side triage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Parse an explicit priority string from an event payload
    pub fn from_field(s: &str) -> Option<Priority> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" | "urgent" => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Envelope delivered to the bridge webhook (POST /events)
///
/// Follows the CloudEvents-flavored shape of the upstream broker:
/// `{id, type, source, data, specversion?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specversion: Option<String>,
}

impl ResultEnvelope {
    /// Validate a raw JSON body as an envelope
    ///
    /// Field-by-field so the failure acknowledgment can name what is
    /// missing instead of surfacing a serde parse error.
    pub fn parse(value: &Value) -> Result<ResultEnvelope> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidInput("envelope must be a JSON object".into()))?;

        let field = |name: &str| -> Result<String> {
            obj.get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::InvalidInput(format!("missing required field: {}", name)))
        };

        let id = field("id")?;
        let kind = field("type")?;
        let source = field("source")?;
        let data = obj
            .get("data")
            .cloned()
            .ok_or_else(|| Error::InvalidInput("missing required field: data".into()))?;
        let specversion = obj
            .get("specversion")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(ResultEnvelope {
            id,
            kind,
            source,
            data,
            specversion,
        })
    }
}

/// Acknowledgment status returned to the delivering system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Processed; includes zero-recipient deliveries
    Success,
    /// Malformed or unprocessable; must not be retried
    Failure,
    /// Transient internal error; eligible for upstream retry
    Retry,
}

/// Routing outcome included in successful acknowledgments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub topic: String,
    pub delivered: usize,
    pub priority: Priority,
}

/// Acknowledgment contract for the bridge webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub status: AckStatus,
    pub event_id: String,
    pub correlation_id: Uuid,
    /// Wall-clock processing time in milliseconds
    pub processing_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingInfo>,
}

impl Acknowledgment {
    pub fn success(event_id: &str, elapsed_ms: u64, routing: RoutingInfo) -> Self {
        Self {
            status: AckStatus::Success,
            event_id: event_id.to_string(),
            correlation_id: Uuid::new_v4(),
            processing_time: elapsed_ms,
            routing: Some(routing),
        }
    }

    pub fn failure(event_id: &str, elapsed_ms: u64) -> Self {
        Self {
            status: AckStatus::Failure,
            event_id: event_id.to_string(),
            correlation_id: Uuid::new_v4(),
            processing_time: elapsed_ms,
            routing: None,
        }
    }

    pub fn retry(event_id: &str, elapsed_ms: u64) -> Self {
        Self {
            status: AckStatus::Retry,
            event_id: event_id.to_string(),
            correlation_id: Uuid::new_v4(),
            processing_time: elapsed_ms,
            routing: None,
        }
    }
}

/// Outbound score-update message, published once state is committed
///
/// `previous_score` lets clients render a delta without a second query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub subject_id: String,
    pub score: ScoreResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_score: Option<f64>,
}
