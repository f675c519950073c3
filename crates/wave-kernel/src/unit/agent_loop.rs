//! Bounded agent loop

use super::Checkpoint;
use crate::error::UnitError;
use wave_core::{Agent, EngineConfig, FinishReason, StepRequest};

/// Bounds for one agent-loop pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    /// Steps per pass
    pub max_iterations: u32,
    /// Consecutive failing steps that abort the unit
    pub max_consecutive_errors: u32,
}

impl From<&EngineConfig> for LoopLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_consecutive_errors: config.max_consecutive_errors,
        }
    }
}

/// Result of one agent-loop pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Text emitted across the pass
    pub text: String,
    /// Steps attempted, failed ones included
    pub steps: u32,
    /// Reason the last successful step stopped, `None` if the pass ran out
    /// of iterations
    pub finish_reason: Option<FinishReason>,
}

impl LoopOutcome {
    /// Pass ended because the iteration bound was reached
    #[inline]
    #[must_use]
    pub fn hit_iteration_limit(&self) -> bool {
        self.finish_reason.is_none()
    }
}

/// Step the agent until it stops asking for tool calls
///
/// Terminates after at most `max_iterations` steps, or earlier once
/// `max_consecutive_errors` steps in a row have failed.
///
/// # Errors
/// - `UnitError::StepsExhausted` on too many consecutive step errors
/// - `UnitError::Cancelled` when a checkpoint trips
pub async fn run_agent_loop(
    agent: &dyn Agent,
    request: &StepRequest,
    limits: LoopLimits,
    checkpoint: &Checkpoint,
) -> Result<LoopOutcome, UnitError> {
    let mut text = String::new();
    let mut consecutive_errors = 0;

    for step in 1..=limits.max_iterations {
        checkpoint.ensure_active().await?;

        match agent.step(request.clone()).await {
            Ok(outcome) => {
                consecutive_errors = 0;
                if !outcome.text.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&outcome.text);
                }
                tracing::debug!(step, finish_reason = ?outcome.finish_reason, "agent step");
                if !outcome.finish_reason.wants_another_step() {
                    return Ok(LoopOutcome {
                        text,
                        steps: step,
                        finish_reason: Some(outcome.finish_reason),
                    });
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(step, consecutive_errors, error = %e, "agent step failed");
                if consecutive_errors >= limits.max_consecutive_errors {
                    return Err(UnitError::StepsExhausted {
                        errors: consecutive_errors,
                        last: e,
                    });
                }
            }
        }
    }

    tracing::warn!(
        max_iterations = limits.max_iterations,
        "agent loop hit its iteration bound"
    );
    Ok(LoopOutcome {
        text,
        steps: limits.max_iterations,
        finish_reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wave_core::{
        BatchOrchestration, MemoryStore, PromptRef, StepOutcome, StepScope, Store, TaskExecution,
        ThreadId, UserId,
    };
    use wave_test_utils::{NoopTools, ScriptedAgent, Step};

    async fn fixture() -> (Checkpoint, StepRequest) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let batch = store
            .insert_batch(BatchOrchestration::new(
                UserId::new("u"),
                "task",
                vec!["Acme".into()],
                1,
            ))
            .await
            .unwrap();
        let exec = store
            .insert_execution(TaskExecution::queued("task Acme").for_target(batch.id, "Acme"))
            .await
            .unwrap();
        let request = StepRequest {
            thread_id: ThreadId::new(),
            system_prompt: "sys".into(),
            prompt: PromptRef::Original(wave_core::MessageId::new()),
            tools: vec![],
            scope: StepScope {
                execution_id: exec.id,
                target: "Acme".into(),
                row_id: None,
                tools: Arc::new(NoopTools),
            },
        };
        (Checkpoint::new(store, batch.id, exec.id), request)
    }

    fn limits(max_iterations: u32) -> LoopLimits {
        LoopLimits {
            max_iterations,
            max_consecutive_errors: 3,
        }
    }

    #[tokio::test]
    async fn tool_calls_continue_until_stop() {
        let (checkpoint, request) = fixture().await;
        let agent = ScriptedAgent::new(vec![
            Step::Ok(StepOutcome::tool_calls("searching")),
            Step::Ok(StepOutcome::tool_calls("reading")),
            Step::Ok(StepOutcome::stop("done")),
        ]);
        let out = run_agent_loop(&agent, &request, limits(100), &checkpoint)
            .await
            .unwrap();
        assert_eq!(out.steps, 3);
        assert_eq!(out.text, "searching\nreading\ndone");
        assert_eq!(out.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn three_consecutive_errors_are_fatal() {
        let (checkpoint, request) = fixture().await;
        let agent = ScriptedAgent::new(vec![Step::Err, Step::Err, Step::Err]);
        let err = run_agent_loop(&agent, &request, limits(100), &checkpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, UnitError::StepsExhausted { errors: 3, .. }));
        assert_eq!(agent.calls(), 3);
    }

    #[tokio::test]
    async fn success_resets_error_counter() {
        let (checkpoint, request) = fixture().await;
        let agent = ScriptedAgent::new(vec![
            Step::Err,
            Step::Err,
            Step::Ok(StepOutcome::tool_calls("ok")),
            Step::Err,
            Step::Err,
            Step::Ok(StepOutcome::stop("done")),
        ]);
        let out = run_agent_loop(&agent, &request, limits(100), &checkpoint)
            .await
            .unwrap();
        assert_eq!(out.steps, 6);
    }

    #[tokio::test]
    async fn iteration_bound_ends_the_pass() {
        let (checkpoint, request) = fixture().await;
        let agent = ScriptedAgent::repeating(Step::Ok(StepOutcome::tool_calls("again")));
        let out = run_agent_loop(&agent, &request, limits(7), &checkpoint)
            .await
            .unwrap();
        assert!(out.hit_iteration_limit());
        assert_eq!(agent.calls(), 7);
    }

    #[tokio::test]
    async fn non_tool_finish_reasons_stop() {
        let (checkpoint, request) = fixture().await;
        let agent = ScriptedAgent::new(vec![Step::Ok(StepOutcome {
            finish_reason: FinishReason::Length,
            text: "truncated".into(),
        })]);
        let out = run_agent_loop(&agent, &request, limits(100), &checkpoint)
            .await
            .unwrap();
        assert_eq!(out.steps, 1);
        assert_eq!(out.finish_reason, Some(FinishReason::Length));
    }
}
