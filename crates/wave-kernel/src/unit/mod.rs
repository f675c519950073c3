//! Per-target unit of work
//!
//! One unit drives one execution: it opens the conversation thread, resolves
//! its mode once, runs the review gate (which wraps the agent loop), persists
//! the outcome and hands exactly one completion event to the sink.
//!
//! Cancellation is cooperative: [`Checkpoint::ensure_active`] runs before
//! every agent step and every review.

mod agent_loop;
mod review_gate;

pub use agent_loop::{run_agent_loop, LoopLimits, LoopOutcome};
pub use review_gate::{rubric_for_schema, GateOutcome};

use crate::aggregator::CompletionSink;
use crate::error::{UnitError, CANCELLED_BY_CALLER};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::Instrument;
use wave_core::agent::{DELEGATE_TOOL, SAVE_VALUES_TOOL, SCRATCHPAD_TOOL};
use wave_core::{
    modify_execution, Agent, AgentError, BatchId, BatchOrchestration, BatchStatus,
    CompletionContext, CompletionEvent, Conversations, DelegationTree, EngineConfig, ExecutionId,
    ExecutionStatus, FieldValues, MessageId, Modify, OutputSchema, Reviewer, Role, RowId, Rubric,
    SlotId, StepScope, Store, TaskExecution, ThreadId, ToolHost, ToolSpec, UnitId, UnitResult,
    UserId,
};

/// Everything needed to start (or restart) one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLaunch {
    /// Unit identifier, stable across reschedules
    pub unit_id: UnitId,
    /// Batch owner, selects the worker-pool partition
    pub owner: UserId,
    /// Completion context echoed back to the aggregator
    pub context: CompletionContext,
}

impl UnitLaunch {
    /// Launch for an execution of `batch`
    #[must_use]
    pub fn new(batch: &BatchOrchestration, execution: &TaskExecution, target: &str) -> Self {
        Self {
            unit_id: execution.unit_id(),
            owner: batch.owner.clone(),
            context: CompletionContext {
                batch_id: batch.id,
                target: target.to_string(),
                task_execution_id: execution.id,
                queue_slot_id: None,
            },
        }
    }

    /// Completion event carrying `result`
    #[must_use]
    pub fn event(&self, result: UnitResult, slot: Option<SlotId>) -> CompletionEvent {
        let mut context = self.context.clone();
        context.queue_slot_id = slot;
        CompletionEvent {
            unit_id: self.unit_id.clone(),
            result,
            context,
        }
    }
}

/// How the unit captures and checks its output, resolved once at start
#[derive(Debug, Clone, PartialEq)]
pub enum UnitMode {
    /// Free-form report, single agent-loop pass
    Generic,
    /// Structured capture into a result row behind the review gate
    Dataset {
        /// Output schema
        schema: OutputSchema,
        /// Row receiving the values
        row: RowId,
        /// Rubric the reviewer scores against
        rubric: Rubric,
    },
}

impl UnitMode {
    /// Row for dataset mode
    #[inline]
    #[must_use]
    pub fn row(&self) -> Option<RowId> {
        match self {
            Self::Generic => None,
            Self::Dataset { row, .. } => Some(*row),
        }
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let mut tools = vec![
            ToolSpec::new(SCRATCHPAD_TOOL, "Record working notes and a progress label"),
            ToolSpec::new(DELEGATE_TOOL, "Hand a sub-task to a child research thread"),
        ];
        if let Self::Dataset { schema, .. } = self {
            tools.push(ToolSpec::new(
                SAVE_VALUES_TOOL,
                format!("Save values for: {}", schema.field_names().join(", ")),
            ));
        }
        tools
    }
}

/// Result recorded on a terminal execution, if it has one
#[must_use]
pub fn terminal_result(execution: &TaskExecution) -> Option<UnitResult> {
    match execution.status {
        ExecutionStatus::Completed => Some(UnitResult::success()),
        ExecutionStatus::Failed => {
            let error = execution.error.clone().unwrap_or_default();
            Some(if error == CANCELLED_BY_CALLER {
                UnitResult::canceled(error)
            } else {
                UnitResult::failed(error)
            })
        }
        _ => None,
    }
}

/// Cooperative cancellation probe
pub struct Checkpoint {
    store: Arc<dyn Store>,
    batch: BatchId,
    execution: ExecutionId,
}

impl Checkpoint {
    /// Probe for one execution of `batch`
    #[must_use]
    pub fn new(store: Arc<dyn Store>, batch: BatchId, execution: ExecutionId) -> Self {
        Self {
            store,
            batch,
            execution,
        }
    }

    /// Fail with [`UnitError::Cancelled`] once the batch is cancelled or the
    /// execution was closed from outside
    ///
    /// # Errors
    /// `UnitError::Cancelled`, or store failures.
    pub async fn ensure_active(&self) -> Result<(), UnitError> {
        if self.store.execution(self.execution).await?.status.is_terminal() {
            return Err(UnitError::Cancelled);
        }
        if self.store.batch(self.batch).await?.status == BatchStatus::Cancelled {
            return Err(UnitError::Cancelled);
        }
        Ok(())
    }
}

/// Tool side effects bound to one unit
struct UnitTools {
    store: Arc<dyn Store>,
    execution: ExecutionId,
    row: Option<RowId>,
    delegation: DelegationTree,
}

fn tool_error(tool: &str, e: impl std::fmt::Display) -> AgentError {
    AgentError::Tool {
        tool: tool.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl ToolHost for UnitTools {
    async fn save_values(&self, values: FieldValues) -> Result<usize, AgentError> {
        let row = self
            .row
            .ok_or_else(|| tool_error(SAVE_VALUES_TOOL, "no result row in generic mode"))?;
        let mut written = 0;
        for (field, value) in values {
            let Some(value) = value else { continue };
            self.store
                .update_cell(row, &field, value)
                .await
                .map_err(|e| tool_error(SAVE_VALUES_TOOL, e))?;
            written += 1;
        }
        Ok(written)
    }

    async fn update_scratchpad(
        &self,
        text: &str,
        progress: Option<&str>,
    ) -> Result<(), AgentError> {
        modify_execution(self.store.as_ref(), self.execution, |e| {
            if e.status.is_terminal() {
                return Ok(Modify::Skip(()));
            }
            e.scratchpad = Some(text.to_string());
            if let Some(label) = progress {
                e.progress_label = Some(label.to_string());
            }
            Ok(Modify::Write(()))
        })
        .await
        .map(|_| ())
        .map_err(|e| tool_error(SCRATCHPAD_TOOL, e))
    }

    async fn delegate(
        &self,
        parent: Option<ThreadId>,
        title: &str,
        brief: &str,
    ) -> Result<ThreadId, AgentError> {
        let parent = parent.unwrap_or_else(|| self.delegation.root());
        self.delegation
            .delegate(parent, title, brief)
            .await
            .map_err(|e| tool_error(DELEGATE_TOOL, e))
    }
}

/// Per-unit state threaded through the gate and the agent loop
pub(crate) struct UnitCtx {
    pub(crate) execution_id: ExecutionId,
    pub(crate) target: String,
    pub(crate) task: String,
    pub(crate) thread: ThreadId,
    pub(crate) original_prompt: MessageId,
    pub(crate) scope: StepScope,
    pub(crate) checkpoint: Checkpoint,
}

/// Runs units of work and reports their completion
pub struct UnitRunner {
    store: Arc<dyn Store>,
    agent: Arc<dyn Agent>,
    reviewer: Arc<dyn Reviewer>,
    conversations: Arc<dyn Conversations>,
    sink: Arc<dyn CompletionSink>,
    config: EngineConfig,
}

impl UnitRunner {
    /// Create a runner
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        agent: Arc<dyn Agent>,
        reviewer: Arc<dyn Reviewer>,
        conversations: Arc<dyn Conversations>,
        sink: Arc<dyn CompletionSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            agent,
            reviewer,
            conversations,
            sink,
            config,
        }
    }

    /// Run the unit and report its completion
    pub async fn run_and_report(&self, launch: UnitLaunch, slot: Option<SlotId>) {
        let event = self.run(&launch, slot).await;
        self.report(event).await;
    }

    /// Hand a completion event to the sink, logging failures
    pub async fn report(&self, event: CompletionEvent) {
        let unit_id = event.unit_id.clone();
        if let Err(e) = self.sink.report(event).await {
            tracing::error!(unit_id = %unit_id, error = %e, "completion report failed");
        }
    }

    /// Run the unit to a terminal state and build its completion event
    ///
    /// Never fails: every error ends as a `failed` (or `canceled`) result on
    /// the event and, where possible, on the execution record.
    pub async fn run(&self, launch: &UnitLaunch, slot: Option<SlotId>) -> CompletionEvent {
        let span = tracing::info_span!(
            "unit",
            unit_id = %launch.unit_id,
            target = %launch.context.target,
        );
        let result = self.run_to_result(launch).instrument(span).await;
        launch.event(result, slot)
    }

    async fn run_to_result(&self, launch: &UnitLaunch) -> UnitResult {
        match self.execute(launch).await {
            Ok(result) => result,
            Err(e) => {
                let text = e.to_string();
                if e.is_cancellation() {
                    tracing::info!("unit stopped by cancellation");
                } else {
                    tracing::error!(error = %text, "unit failed");
                }
                self.mark_failed(launch.context.task_execution_id, &text)
                    .await;
                if e.is_cancellation() {
                    UnitResult::canceled(text)
                } else {
                    UnitResult::failed(text)
                }
            }
        }
    }

    async fn execute(&self, launch: &UnitLaunch) -> Result<UnitResult, UnitError> {
        let execution_id = launch.context.task_execution_id;
        let batch_id = launch.context.batch_id;

        let execution = self.store.execution(execution_id).await?;
        if let Some(result) = terminal_result(&execution) {
            tracing::debug!("execution already terminal, re-reporting");
            return Ok(result);
        }

        let checkpoint = Checkpoint::new(self.store.clone(), batch_id, execution_id);
        checkpoint.ensure_active().await?;

        let batch = self.store.batch(batch_id).await?;
        let execution = self.start(launch, &execution).await?;
        let (thread, original_prompt) = self.open_thread(&execution, &launch.context.target).await?;
        let mode = self.resolve_mode(&batch, execution_id).await?;
        tracing::info!(dataset = matches!(mode, UnitMode::Dataset { .. }), "unit started");

        let tools = Arc::new(UnitTools {
            store: self.store.clone(),
            execution: execution_id,
            row: mode.row(),
            delegation: DelegationTree::new(
                thread,
                self.config.delegation_policy(),
                self.conversations.clone(),
            ),
        });
        let ctx = UnitCtx {
            execution_id,
            target: launch.context.target.clone(),
            task: batch.task.clone(),
            thread,
            original_prompt,
            scope: StepScope {
                execution_id,
                target: launch.context.target.clone(),
                row_id: mode.row(),
                tools,
            },
            checkpoint,
        };

        let outcome = self.run_review_gate(&ctx, &mode).await?;
        self.complete(execution_id, outcome).await?;
        Ok(UnitResult::success())
    }

    async fn start(
        &self,
        launch: &UnitLaunch,
        execution: &TaskExecution,
    ) -> Result<TaskExecution, UnitError> {
        let unit_id = launch.unit_id.clone();
        let (started, written) = modify_execution(self.store.as_ref(), execution.id, |e| {
            if e.status.is_terminal() {
                return Ok(Modify::Skip(false));
            }
            e.unit_id = Some(unit_id.clone());
            // A rescheduled unit restarts an execution that is already running
            if e.status != ExecutionStatus::Running {
                e.transition(ExecutionStatus::Running)?;
            }
            e.progress_label = Some("starting".to_string());
            Ok(Modify::Write(true))
        })
        .await?;
        if !written {
            return Err(UnitError::Cancelled);
        }
        Ok(started)
    }

    async fn open_thread(
        &self,
        execution: &TaskExecution,
        target: &str,
    ) -> Result<(ThreadId, MessageId), UnitError> {
        if let Some(thread) = execution.thread_id {
            let messages = self.conversations.messages(thread).await?;
            if let Some(first) = messages.iter().find(|m| m.role == Role::User) {
                return Ok((thread, first.id));
            }
            let prompt = self
                .conversations
                .append(thread, Role::User, &execution.prompt)
                .await?;
            return Ok((thread, prompt));
        }

        let thread = self.conversations.create_thread(target, None).await?;
        let prompt = self
            .conversations
            .append(thread, Role::User, &execution.prompt)
            .await?;
        modify_execution(self.store.as_ref(), execution.id, |e| {
            e.thread_id = Some(thread);
            Ok(Modify::Write(()))
        })
        .await?;
        Ok((thread, prompt))
    }

    async fn resolve_mode(
        &self,
        batch: &BatchOrchestration,
        execution: ExecutionId,
    ) -> Result<UnitMode, UnitError> {
        let Some(schema_id) = batch.schema_id else {
            return Ok(UnitMode::Generic);
        };
        let schema = self.store.schema(schema_id).await?;
        let row = self
            .store
            .row_for_execution(execution)
            .await?
            .ok_or(UnitError::MissingRow)?;
        let rubric = match batch.rubric_id {
            Some(id) => self.store.rubric(id).await?,
            None => rubric_for_schema(&schema, self.config.pass_threshold),
        };
        Ok(UnitMode::Dataset {
            schema,
            row: row.id,
            rubric,
        })
    }

    async fn complete(&self, execution: ExecutionId, outcome: GateOutcome) -> Result<(), UnitError> {
        let report = outcome.final_report();
        let (_, written) = modify_execution(self.store.as_ref(), execution, |e| {
            if e.status.is_terminal() {
                return Ok(Modify::Skip(false));
            }
            e.report = Some(report.clone());
            e.progress_label = Some("completed".to_string());
            e.transition(ExecutionStatus::Completed)?;
            Ok(Modify::Write(true))
        })
        .await?;
        if !written {
            return Err(UnitError::Cancelled);
        }
        tracing::info!(
            attempts = outcome.attempts,
            warned = outcome.warning.is_some(),
            "unit completed"
        );
        Ok(())
    }

    pub(crate) async fn mark_failed(&self, execution: ExecutionId, error: &str) {
        let marked = modify_execution(self.store.as_ref(), execution, |e| {
            if e.status.is_terminal() {
                return Ok(Modify::Skip(()));
            }
            e.error = Some(error.to_string());
            e.progress_label = Some("failed".to_string());
            e.transition(ExecutionStatus::Failed)?;
            Ok(Modify::Write(()))
        })
        .await;
        if let Err(e) = marked {
            tracing::error!(execution_id = %execution, error = %e, "could not mark execution failed");
        }
    }

    pub(crate) fn agent(&self) -> &dyn Agent {
        self.agent.as_ref()
    }

    pub(crate) fn reviewer(&self) -> &dyn Reviewer {
        self.reviewer.as_ref()
    }

    pub(crate) fn conversations(&self) -> &dyn Conversations {
        self.conversations.as_ref()
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_failure_maps_back_to_canceled() {
        let mut exec = TaskExecution::queued("p");
        exec.status = ExecutionStatus::Failed;
        exec.error = Some(CANCELLED_BY_CALLER.to_string());
        assert_eq!(
            terminal_result(&exec),
            Some(UnitResult::canceled(CANCELLED_BY_CALLER))
        );

        exec.error = Some("boom".to_string());
        assert_eq!(terminal_result(&exec), Some(UnitResult::failed("boom")));

        exec.status = ExecutionStatus::Running;
        assert_eq!(terminal_result(&exec), None);
    }

    #[test]
    fn dataset_mode_exposes_save_tool() {
        let schema = OutputSchema::new("s").field("revenue", "");
        let mode = UnitMode::Dataset {
            rubric: rubric_for_schema(&schema, 0.75),
            schema,
            row: RowId::new(),
        };
        assert!(mode.tools().iter().any(|t| t.name == SAVE_VALUES_TOOL));
        assert!(!UnitMode::Generic
            .tools()
            .iter()
            .any(|t| t.name == SAVE_VALUES_TOOL));
    }
}
