//! Review gate
//!
//! Wraps the agent loop in at most `max_review_attempts` passes. A failing
//! review injects its feedback into the thread and the next pass answers that
//! message; the last attempt is accepted even when it fails, with a warning
//! appended to the report.

use super::agent_loop::{run_agent_loop, LoopLimits};
use super::{UnitCtx, UnitMode, UnitRunner};
use crate::error::UnitError;
use chrono::Utc;
use wave_core::{
    modify_execution, EntityContext, Modify, OutputSchema, PromptRef, ReviewAttempt,
    ReviewResult, Role, Rubric, StepRequest,
};

/// Accepted research output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    /// Text accumulated over every pass
    pub report: String,
    /// Review-gate attempts used
    pub attempts: u32,
    /// Warning appended when the result was accepted without passing review
    pub warning: Option<String>,
}

impl GateOutcome {
    /// Report with the warning, if any, appended
    #[must_use]
    pub fn final_report(&self) -> String {
        match &self.warning {
            Some(w) if self.report.is_empty() => w.clone(),
            Some(w) => format!("{}\n\n{w}", self.report),
            None => self.report.clone(),
        }
    }
}

/// Equal-weight rubric asking for every schema field to be filled and sourced
#[must_use]
pub fn rubric_for_schema(schema: &OutputSchema, pass_threshold: f64) -> Rubric {
    schema.fields.iter().fold(Rubric::new(pass_threshold), |rubric, field| {
        rubric.criterion(
            field.name.clone(),
            format!("{} is filled in and sourced", field.description),
            1.0,
        )
    })
}

impl UnitRunner {
    pub(crate) async fn run_review_gate(
        &self,
        ctx: &UnitCtx,
        mode: &UnitMode,
    ) -> Result<GateOutcome, UnitError> {
        let limits = LoopLimits::from(self.config());
        let max_attempts = self.config().max_review_attempts.max(1);
        let mut prompt = PromptRef::Original(ctx.original_prompt);
        let mut report = String::new();

        for attempt in 1..=max_attempts {
            let request = StepRequest {
                thread_id: ctx.thread,
                system_prompt: self.config().system_prompt.clone(),
                prompt,
                tools: mode.tools(),
                scope: ctx.scope.clone(),
            };
            let pass = run_agent_loop(self.agent(), &request, limits, &ctx.checkpoint).await?;
            if !pass.text.is_empty() {
                if !report.is_empty() {
                    report.push_str("\n\n");
                }
                report.push_str(&pass.text);
            }

            let UnitMode::Dataset { row, rubric, .. } = mode else {
                return Ok(GateOutcome {
                    report,
                    attempts: 1,
                    warning: None,
                });
            };

            ctx.checkpoint.ensure_active().await?;
            let values = self.store().row(*row).await?.cells;
            let entity = EntityContext {
                target: ctx.target.clone(),
                task: ctx.task.clone(),
            };
            let mut review = match self.reviewer().review(&entity, &values, rubric).await {
                Ok(review) => review,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reviewer unavailable, accepting result");
                    return Ok(GateOutcome {
                        report,
                        attempts: attempt,
                        warning: Some(format!(
                            "Warning: quality review could not run ({e}); result accepted unreviewed."
                        )),
                    });
                }
            };
            // The rubric threshold decides, not the reviewer's own verdict
            let passed = rubric.passes(review.overall_score);
            if passed != review.passed {
                tracing::warn!(
                    attempt,
                    score = review.overall_score,
                    threshold = rubric.pass_threshold,
                    reviewer_passed = review.passed,
                    "reviewer verdict disagrees with rubric threshold"
                );
                review.passed = passed;
            }
            self.record_review(ctx, attempt, &review).await?;

            if review.passed {
                tracing::info!(attempt, score = review.overall_score, "review passed");
                return Ok(GateOutcome {
                    report,
                    attempts: attempt,
                    warning: None,
                });
            }
            if attempt == max_attempts {
                tracing::warn!(
                    attempt,
                    score = review.overall_score,
                    threshold = rubric.pass_threshold,
                    "review failed on final attempt, accepting with warning"
                );
                return Ok(GateOutcome {
                    report,
                    attempts: attempt,
                    warning: Some(format!(
                        "Warning: quality review did not pass after {attempt} attempts \
                         (final score {:.2}, threshold {:.2}); result accepted as-is.",
                        review.overall_score, rubric.pass_threshold
                    )),
                });
            }

            tracing::info!(attempt, score = review.overall_score, "review failed, injecting feedback");
            let message = self
                .conversations()
                .append(ctx.thread, Role::User, &review.feedback_message())
                .await?;
            prompt = PromptRef::Feedback { message, attempt };
        }

        Ok(GateOutcome {
            report,
            attempts: max_attempts,
            warning: None,
        })
    }

    async fn record_review(
        &self,
        ctx: &UnitCtx,
        attempt: u32,
        review: &ReviewResult,
    ) -> Result<(), UnitError> {
        let entry = ReviewAttempt {
            attempt,
            score: review.overall_score,
            passed: review.passed,
            at: Utc::now(),
        };
        modify_execution(self.store(), ctx.execution_id, |e| {
            if e.status.is_terminal() {
                return Ok(Modify::Skip(()));
            }
            e.review_history.push(entry.clone());
            e.progress_label = Some(format!("reviewed, attempt {attempt}"));
            Ok(Modify::Write(()))
        })
        .await?;
        Ok(())
    }
}
