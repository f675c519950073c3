//! Review gate model
//!
//! Rubrics, review results, the reviewer collaborator and the feedback
//! message injected into a thread when an attempt falls short.

use crate::error::ReviewError;
use crate::types::RubricId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Captured structured values, keyed by schema field
pub type FieldValues = BTreeMap<String, Option<serde_json::Value>>;

/// One weighted rubric criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Criterion name
    pub name: String,
    /// What a good answer looks like
    pub description: String,
    /// Relative weight (> 0)
    pub weight: f64,
}

/// Scoring rubric for the review gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    /// Rubric identifier
    pub id: RubricId,
    /// Weighted criteria
    pub criteria: Vec<Criterion>,
    /// Overall score needed to pass
    pub pass_threshold: f64,
}

impl Rubric {
    /// Create rubric with the given threshold
    #[must_use]
    pub fn new(pass_threshold: f64) -> Self {
        Self {
            id: RubricId::new(),
            criteria: Vec::new(),
            pass_threshold: pass_threshold.clamp(0.0, 1.0),
        }
    }

    /// Add a criterion
    #[must_use]
    pub fn criterion(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        weight: f64,
    ) -> Self {
        self.criteria.push(Criterion {
            name: name.into(),
            description: description.into(),
            weight,
        });
        self
    }

    /// Weighted mean of per-criterion scores, clamped to [0, 1]
    ///
    /// Criteria without a score count as zero.
    ///
    /// # Errors
    /// `ReviewError::InvalidRubric` if the rubric has no positive weight.
    pub fn weighted_score(&self, scores: &[CriterionScore]) -> Result<f64, ReviewError> {
        let total_weight: f64 = self.criteria.iter().map(|c| c.weight.max(0.0)).sum();
        if total_weight <= 0.0 {
            return Err(ReviewError::InvalidRubric(
                "rubric has no positively weighted criteria".to_string(),
            ));
        }

        let weighted: f64 = self
            .criteria
            .iter()
            .map(|c| {
                let score = scores
                    .iter()
                    .find(|s| s.criterion == c.name)
                    .map_or(0.0, |s| s.score.clamp(0.0, 1.0));
                score * c.weight.max(0.0)
            })
            .sum();

        Ok((weighted / total_weight).clamp(0.0, 1.0))
    }

    /// Whether `score` meets the threshold
    #[inline]
    #[must_use]
    pub fn passes(&self, score: f64) -> bool {
        score >= self.pass_threshold
    }
}

/// Score and feedback for one criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    /// Criterion name
    pub criterion: String,
    /// Score in [0, 1]
    pub score: f64,
    /// Reviewer feedback
    pub feedback: String,
}

/// Outcome of one review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    /// Whether the threshold was met
    pub passed: bool,
    /// Weighted overall score in [0, 1]
    pub overall_score: f64,
    /// Free-text summary
    pub summary: String,
    /// Actionable fixes
    pub recommendations: Vec<String>,
    /// Per-criterion breakdown
    pub criteria: Vec<CriterionScore>,
}

impl ReviewResult {
    /// Build a result from per-criterion scores using the rubric's weights
    ///
    /// # Errors
    /// Propagates [`Rubric::weighted_score`] failures.
    pub fn scored(
        rubric: &Rubric,
        criteria: Vec<CriterionScore>,
        summary: impl Into<String>,
        recommendations: Vec<String>,
    ) -> Result<Self, ReviewError> {
        let overall_score = rubric.weighted_score(&criteria)?;
        Ok(Self {
            passed: rubric.passes(overall_score),
            overall_score,
            summary: summary.into(),
            recommendations,
            criteria,
        })
    }

    /// Feedback message injected into the thread to drive the next attempt
    #[must_use]
    pub fn feedback_message(&self) -> String {
        let mut msg = String::new();
        let verdict = if self.passed { "PASSED" } else { "FAILED" };
        let _ = writeln!(
            msg,
            "Quality review {verdict} with an overall score of {:.2}.",
            self.overall_score
        );
        let _ = writeln!(msg);
        let _ = writeln!(msg, "Summary: {}", self.summary);

        if !self.recommendations.is_empty() {
            let _ = writeln!(msg);
            let _ = writeln!(msg, "Fix the following:");
            for (i, rec) in self.recommendations.iter().enumerate() {
                let _ = writeln!(msg, "{}. {rec}", i + 1);
            }
        }

        let _ = writeln!(msg);
        msg.push_str(
            "Research the gaps above, then call the value-saving tool again to store the \
             corrected values.",
        );
        msg
    }
}

/// Entity under review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityContext {
    /// Target name
    pub target: String,
    /// Research instruction
    pub task: String,
}

/// Automated quality reviewer
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Score the captured values against the rubric
    async fn review(
        &self,
        entity: &EntityContext,
        values: &FieldValues,
        rubric: &Rubric,
    ) -> Result<ReviewResult, ReviewError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rubric() -> Rubric {
        Rubric::new(0.75)
            .criterion("accuracy", "facts are sourced", 3.0)
            .criterion("coverage", "every field filled", 1.0)
    }

    fn score(name: &str, score: f64) -> CriterionScore {
        CriterionScore {
            criterion: name.to_string(),
            score,
            feedback: String::new(),
        }
    }

    #[test]
    fn weighted_score_uses_weights() {
        let s = rubric()
            .weighted_score(&[score("accuracy", 1.0), score("coverage", 0.0)])
            .unwrap();
        assert!((s - 0.75).abs() < 1e-9);
    }

    #[test]
    fn missing_criteria_score_zero() {
        let s = rubric().weighted_score(&[score("coverage", 1.0)]).unwrap();
        assert!((s - 0.25).abs() < 1e-9);
    }

    #[test]
    fn empty_rubric_is_invalid() {
        assert!(matches!(
            Rubric::new(0.5).weighted_score(&[]),
            Err(ReviewError::InvalidRubric(_))
        ));
    }

    #[test]
    fn threshold_is_inclusive() {
        let result = ReviewResult::scored(
            &rubric(),
            vec![score("accuracy", 1.0), score("coverage", 0.0)],
            "ok",
            vec![],
        )
        .unwrap();
        assert!(result.passed);
    }

    #[test]
    fn feedback_message_lists_numbered_fixes() {
        let result = ReviewResult {
            passed: false,
            overall_score: 0.6,
            summary: "Revenue is unsourced".to_string(),
            recommendations: vec!["Cite the annual report".to_string(), "Fill HQ".to_string()],
            criteria: vec![],
        };
        let msg = result.feedback_message();
        assert!(msg.contains("FAILED"));
        assert!(msg.contains("0.60"));
        assert!(msg.contains("Revenue is unsourced"));
        assert!(msg.contains("1. Cite the annual report"));
        assert!(msg.contains("2. Fill HQ"));
        assert!(msg.contains("value-saving tool"));
    }
}
