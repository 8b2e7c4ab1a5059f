//! Mastery score domain: components, levels, recommendations
//!
//! The calculator is a pure function over [`ComponentScores`]: no I/O,
//! deterministic for a fixed input. The pipeline around it supplies
//! subject identity and timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Components strictly below this value generate a recommendation
pub const IMPROVEMENT_THRESHOLD: f64 = 0.7;

/// Calculator errors are caller errors: the pipeline validates inputs
/// before invoking the calculator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("component {component} out of range [0,1]: {value}")]
    OutOfRange { component: &'static str, value: f64 },
}

/// The four scored components of mastery
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Completion,
    Assessment,
    Quality,
    Consistency,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Completion,
        Component::Assessment,
        Component::Quality,
        Component::Consistency,
    ];

    /// Fixed component weight; weights sum to 1.0
    pub fn weight(&self) -> f64 {
        match self {
            Component::Completion => 0.4,
            Component::Assessment => 0.3,
            Component::Quality => 0.2,
            Component::Consistency => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Completion => "completion",
            Component::Assessment => "assessment",
            Component::Quality => "quality",
            Component::Consistency => "consistency",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bounded component scores in `[0.0, 1.0]`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ComponentScores {
    pub completion: f64,
    pub assessment: f64,
    pub quality: f64,
    pub consistency: f64,
}

impl ComponentScores {
    pub fn get(&self, component: Component) -> f64 {
        match component {
            Component::Completion => self.completion,
            Component::Assessment => self.assessment,
            Component::Quality => self.quality,
            Component::Consistency => self.consistency,
        }
    }

    /// All components with their values, in weight order
    pub fn iter(&self) -> impl Iterator<Item = (Component, f64)> + '_ {
        Component::ALL.iter().map(move |c| (*c, self.get(*c)))
    }

    pub fn validate(&self) -> Result<(), ScoreError> {
        for (component, value) in self.iter() {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ScoreError::OutOfRange {
                    component: component.as_str(),
                    value,
                });
            }
        }
        Ok(())
    }
}

/// Mastery level, five ordered tiers spanning `[0, 1]`
///
/// A composite score maps to the highest tier whose threshold it meets
/// or exceeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Novice,
    Developing,
    Proficient,
    Advanced,
    Expert,
}

impl Level {
    /// Lowest composite score that qualifies for this level
    pub fn threshold(&self) -> f64 {
        match self {
            Level::Novice => 0.0,
            Level::Developing => 0.25,
            Level::Proficient => 0.5,
            Level::Advanced => 0.75,
            Level::Expert => 0.9,
        }
    }

    /// Highest level whose threshold the composite meets or exceeds
    pub fn from_composite(composite: f64) -> Level {
        let ordered = [
            Level::Expert,
            Level::Advanced,
            Level::Proficient,
            Level::Developing,
        ];
        for level in ordered {
            if composite >= level.threshold() {
                return level;
            }
        }
        Level::Novice
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Novice => "novice",
            Level::Developing => "developing",
            Level::Proficient => "proficient",
            Level::Advanced => "advanced",
            Level::Expert => "expert",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Urgency of a recommendation, derived from how far the component
/// sits below the improvement threshold
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
}

/// A suggested next step for one weak component
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub action: String,
    pub focus_area: String,
    pub priority: RecommendationPriority,
}

/// Derived mastery result for one subject
///
/// Superseded (never mutated) on each recomputation; the prior value is
/// retained as a dated snapshot. `version` is the per-subject
/// optimistic-concurrency counter maintained by the state store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreResult {
    pub subject_id: String,
    pub composite_score: f64,
    pub level: Level,
    pub components: ComponentScores,
    pub recommendations: Vec<Recommendation>,
    pub computed_at: DateTime<Utc>,
    pub version: i64,
}

/// Compute a [`ScoreResult`] from component scores
///
/// Pure and deterministic: same components, subject, and timestamp give
/// the same result. Out-of-range components are a caller error.
pub fn calculate(
    subject_id: &str,
    components: ComponentScores,
    computed_at: DateTime<Utc>,
) -> Result<ScoreResult, ScoreError> {
    components.validate()?;

    let composite_score: f64 = components
        .iter()
        .map(|(component, value)| value * component.weight())
        .sum();

    Ok(ScoreResult {
        subject_id: subject_id.to_string(),
        composite_score,
        level: Level::from_composite(composite_score),
        components,
        recommendations: recommendations_for(&components),
        computed_at,
        version: 0,
    })
}

/// One recommendation per component strictly below the threshold
fn recommendations_for(components: &ComponentScores) -> Vec<Recommendation> {
    components
        .iter()
        .filter(|(_, value)| *value < IMPROVEMENT_THRESHOLD)
        .map(|(component, value)| {
            let gap = IMPROVEMENT_THRESHOLD - value;
            let priority = if gap > 0.3 {
                RecommendationPriority::High
            } else if gap > 0.15 {
                RecommendationPriority::Medium
            } else {
                RecommendationPriority::Low
            };
            Recommendation {
                action: action_for(component).to_string(),
                focus_area: component.as_str().to_string(),
                priority,
            }
        })
        .collect()
}

fn action_for(component: Component) -> &'static str {
    match component {
        Component::Completion => "complete remaining lessons",
        Component::Assessment => "retake practice assessments",
        Component::Quality => "revise submitted work",
        Component::Consistency => "practice on a regular schedule",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(completion: f64, assessment: f64, quality: f64, consistency: f64) -> ComponentScores {
        ComponentScores {
            completion,
            assessment,
            quality,
            consistency,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let total: f64 = Component::ALL.iter().map(|c| c.weight()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_scenario_advanced_no_recommendations() {
        // completion 0.8, assessment 0.9, quality 0.75, consistency 0.8
        let result = calculate("learner-1", scores(0.8, 0.9, 0.75, 0.8), Utc::now()).unwrap();

        assert!((result.composite_score - 0.82).abs() < 1e-9);
        assert_eq!(result.level, Level::Advanced);
        assert!(
            result.recommendations.is_empty(),
            "all components >= 0.7, no recommendations expected"
        );
    }

    #[test]
    fn test_determinism() {
        let at = Utc::now();
        let c = scores(0.31, 0.77, 0.52, 0.9);
        let a = calculate("s", c, at).unwrap();
        let b = calculate("s", c, at).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_boundary_components() {
        let zero = calculate("s", scores(0.0, 0.0, 0.0, 0.0), Utc::now()).unwrap();
        assert_eq!(zero.composite_score, 0.0);
        assert_eq!(zero.level, Level::Novice);

        let one = calculate("s", scores(1.0, 1.0, 1.0, 1.0), Utc::now()).unwrap();
        assert!((one.composite_score - 1.0).abs() < 1e-12);
        assert_eq!(one.level, Level::Expert);
    }

    #[test]
    fn test_threshold_boundary_is_strict() {
        // A component exactly at 0.7 does not generate a recommendation
        let result = calculate("s", scores(0.7, 0.7, 0.7, 0.7), Utc::now()).unwrap();
        assert!(result.recommendations.is_empty());

        let below = calculate("s", scores(0.69, 0.7, 0.7, 0.7), Utc::now()).unwrap();
        assert_eq!(below.recommendations.len(), 1);
        assert_eq!(below.recommendations[0].focus_area, "completion");
    }

    #[test]
    fn test_recommendation_priority_from_gap() {
        // completion gap 0.5 -> high, assessment gap 0.2 -> medium,
        // quality gap 0.05 -> low
        let result = calculate("s", scores(0.2, 0.5, 0.65, 0.9), Utc::now()).unwrap();
        assert_eq!(result.recommendations.len(), 3);

        let by_area = |area: &str| {
            result
                .recommendations
                .iter()
                .find(|r| r.focus_area == area)
                .unwrap()
        };
        assert_eq!(by_area("completion").priority, RecommendationPriority::High);
        assert_eq!(by_area("assessment").priority, RecommendationPriority::Medium);
        assert_eq!(by_area("quality").priority, RecommendationPriority::Low);
    }

    #[test]
    fn test_level_tier_mapping() {
        assert_eq!(Level::from_composite(0.0), Level::Novice);
        assert_eq!(Level::from_composite(0.24), Level::Novice);
        assert_eq!(Level::from_composite(0.25), Level::Developing);
        assert_eq!(Level::from_composite(0.5), Level::Proficient);
        assert_eq!(Level::from_composite(0.75), Level::Advanced);
        assert_eq!(Level::from_composite(0.89), Level::Advanced);
        assert_eq!(Level::from_composite(0.9), Level::Expert);
        assert_eq!(Level::from_composite(1.0), Level::Expert);
    }

    #[test]
    fn test_out_of_range_is_caller_error() {
        let err = calculate("s", scores(1.2, 0.5, 0.5, 0.5), Utc::now()).unwrap_err();
        assert_eq!(
            err,
            ScoreError::OutOfRange {
                component: "completion",
                value: 1.2
            }
        );

        assert!(calculate("s", scores(0.5, -0.1, 0.5, 0.5), Utc::now()).is_err());
        assert!(calculate("s", scores(0.5, 0.5, f64::NAN, 0.5), Utc::now()).is_err());
    }

    #[test]
    fn test_score_result_serialization() {
        let result = calculate("learner-1", scores(0.4, 0.9, 0.6, 0.8), Utc::now()).unwrap();
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["subject_id"], "learner-1");
        assert!(json["composite_score"].is_f64());
        assert!(json["level"].is_string());
        assert_eq!(
            json["recommendations"].as_array().unwrap().len(),
            result.recommendations.len()
        );

        let back: ScoreResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
