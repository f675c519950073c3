//! Core types for Wave
//!
//! Defines the records shared by every component:
//! - Identifiers (ULID newtypes, sortable by creation time)
//! - The batch orchestration record and its status
//! - Task executions (one unit of work per target)
//! - Completion callback payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a fresh identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// Batch orchestration identifier
    BatchId
);
ulid_id!(
    /// Task execution (unit of work record) identifier
    ExecutionId
);
ulid_id!(
    /// Conversation thread identifier
    ThreadId
);
ulid_id!(
    /// Conversation message identifier
    MessageId
);
ulid_id!(
    /// Result row identifier
    RowId
);
ulid_id!(
    /// Structured-output schema identifier
    SchemaId
);
ulid_id!(
    /// Review rubric identifier
    RubricId
);
ulid_id!(
    /// Worker pool slot identifier
    SlotId
);

/// Identifier of a unit-of-work process.
///
/// Derived deterministically from the execution it drives, so a unit that is
/// rescheduled after a restart reports under the same id and the aggregator
/// can deduplicate its completion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub String);

impl UnitId {
    /// Unit id for the unit of work driving `execution`
    #[inline]
    #[must_use]
    pub fn for_execution(execution: ExecutionId) -> Self {
        Self(format!("research-{execution}"))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner of a batch; worker slots are partitioned per user
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a user id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Overall batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Waves are still being dispatched or awaited
    Running,
    /// Finalized with at least one successful target
    Completed,
    /// Every target failed, or the orchestrator itself errored
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl BatchStatus {
    /// Terminal statuses freeze the record
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Position of the orchestrator within the wave sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCursor {
    /// Zero-based chunk index
    pub index: usize,
    /// Targets belonging to this chunk
    pub targets: Vec<String>,
    /// Number of targets in this chunk
    pub size: usize,
}

/// One batch run: N targets researched in waves of `concurrency_limit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOrchestration {
    /// Batch identifier
    pub id: BatchId,
    /// User whose worker slots run this batch
    pub owner: UserId,
    /// Shared research instruction, combined with each target
    pub task: String,
    /// Ordered target identifiers
    pub targets: Vec<String>,
    /// Wave size
    pub concurrency_limit: usize,
    /// Chunk currently in flight
    pub current_chunk: Option<ChunkCursor>,
    /// Units accounted for within the current chunk
    pub completed_in_current_chunk: usize,
    /// Cumulative successful units
    pub completed_count: usize,
    /// Cumulative failed or cancelled units
    pub failed_count: usize,
    /// Units already counted (idempotency set)
    pub counted_units: BTreeSet<UnitId>,
    /// Overall status
    pub status: BatchStatus,
    /// Structured-output schema, enables the review gate
    pub schema_id: Option<SchemaId>,
    /// Review rubric
    pub rubric_id: Option<RubricId>,
    /// Thread that receives the finalization summary
    pub notify_thread: Option<ThreadId>,
    /// Chunks already handed to the dispatcher
    pub dispatched_chunks: BTreeSet<usize>,
    /// Highest chunk index whose wave-advance signal has fired
    pub signalled_chunk: Option<usize>,
    /// Wave-advance signals fired so far
    pub wave_signals_fired: u32,
    /// Orchestrator-level failure text
    pub error: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the batch reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency revision, bumped by every store write
    pub revision: u64,
}

impl BatchOrchestration {
    /// Create a running batch
    #[must_use]
    pub fn new(
        owner: UserId,
        task: impl Into<String>,
        targets: Vec<String>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            id: BatchId::new(),
            owner,
            task: task.into(),
            targets,
            concurrency_limit,
            current_chunk: None,
            completed_in_current_chunk: 0,
            completed_count: 0,
            failed_count: 0,
            counted_units: BTreeSet::new(),
            status: BatchStatus::Running,
            schema_id: None,
            rubric_id: None,
            notify_thread: None,
            dispatched_chunks: BTreeSet::new(),
            signalled_chunk: None,
            wave_signals_fired: 0,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
            revision: 0,
        }
    }

    /// With structured-output schema
    #[inline]
    #[must_use]
    pub fn with_schema(mut self, schema: SchemaId) -> Self {
        self.schema_id = Some(schema);
        self
    }

    /// With review rubric
    #[inline]
    #[must_use]
    pub fn with_rubric(mut self, rubric: RubricId) -> Self {
        self.rubric_id = Some(rubric);
        self
    }

    /// With notification thread
    #[inline]
    #[must_use]
    pub fn with_notify_thread(mut self, thread: ThreadId) -> Self {
        self.notify_thread = Some(thread);
        self
    }

    /// Number of targets
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.targets.len()
    }

    /// Units counted so far, successful or not
    #[inline]
    #[must_use]
    pub fn accounted(&self) -> usize {
        self.completed_count + self.failed_count
    }

    /// True once every target has reported
    #[inline]
    #[must_use]
    pub fn is_fully_accounted(&self) -> bool {
        self.accounted() >= self.total()
    }

    /// Whether the chunk at `index` has had its wave-advance signal recorded
    #[inline]
    #[must_use]
    pub fn wave_signalled(&self, index: usize) -> bool {
        self.signalled_chunk.is_some_and(|s| s >= index)
    }

    /// Move the cursor to a new chunk, resetting the per-chunk counter.
    ///
    /// Re-entering the chunk already under the cursor is a no-op so a resumed
    /// orchestrator keeps the counts gathered before the restart.
    pub fn begin_chunk(&mut self, index: usize, targets: Vec<String>) {
        if self.current_chunk.as_ref().is_some_and(|c| c.index == index) {
            return;
        }
        let size = targets.len();
        self.current_chunk = Some(ChunkCursor {
            index,
            targets,
            size,
        });
        self.completed_in_current_chunk = 0;
    }

    /// Size of the chunk under the cursor
    #[inline]
    #[must_use]
    pub fn current_chunk_size(&self) -> usize {
        self.current_chunk.as_ref().map_or(0, |c| c.size)
    }

    /// Status the batch finalizes to once every wave has reported
    #[must_use]
    pub fn final_status(&self) -> BatchStatus {
        if self.total() > 0 && self.failed_count >= self.total() {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        }
    }
}

/// Status of a single unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Record created, unit not yet started
    Queued,
    /// Unit assigned and running
    Running,
    /// Paused on a human answer
    AwaitingInput,
    /// Finished successfully
    Completed,
    /// Finished with an error, or cancelled
    Failed,
}

impl ExecutionStatus {
    /// Terminal statuses are never reopened
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses reachable from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [ExecutionStatus] {
        match self {
            Self::Queued => &[Self::Running, Self::Failed],
            Self::Running => &[Self::AwaitingInput, Self::Completed, Self::Failed],
            Self::AwaitingInput => &[Self::Running, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    /// Check a transition against the lifecycle
    #[inline]
    #[must_use]
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingInput => "awaiting_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Structured context attached to an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Target entity name
    pub target_name: String,
    /// Field names the research should fill, when a schema is configured
    pub output_shape: Option<Vec<String>>,
}

/// One review-gate attempt, kept on the execution as history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewAttempt {
    /// One-based attempt number
    pub attempt: u32,
    /// Weighted overall score
    pub score: f64,
    /// Whether the attempt passed the threshold
    pub passed: bool,
    /// When the review returned
    pub at: DateTime<Utc>,
}

/// Unit-of-work record, one per target per batch (or standalone)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Execution identifier
    pub id: ExecutionId,
    /// Owning batch, `None` for standalone executions
    pub batch_id: Option<BatchId>,
    /// Target researched by this execution
    pub target: Option<String>,
    /// Unit of work assigned to the execution
    pub unit_id: Option<UnitId>,
    /// Conversation thread the agent runs against
    pub thread_id: Option<ThreadId>,
    /// Lifecycle status
    pub status: ExecutionStatus,
    /// Input prompt (task combined with target)
    pub prompt: String,
    /// Structured context
    pub context: Option<TaskContext>,
    /// Agent working notes
    pub scratchpad: Option<String>,
    /// Short progress label
    pub progress_label: Option<String>,
    /// Final report
    pub report: Option<String>,
    /// Error text for failed executions
    pub error: Option<String>,
    /// Review-gate attempts
    pub review_history: Vec<ReviewAttempt>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the unit started
    pub started_at: Option<DateTime<Utc>>,
    /// Time the execution reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency revision
    pub revision: u64,
}

impl TaskExecution {
    /// Create a queued execution
    #[must_use]
    pub fn queued(prompt: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            batch_id: None,
            target: None,
            unit_id: None,
            thread_id: None,
            status: ExecutionStatus::Queued,
            prompt: prompt.into(),
            context: None,
            scratchpad: None,
            progress_label: None,
            report: None,
            error: None,
            review_history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            revision: 0,
        }
    }

    /// Attach to a batch target
    #[inline]
    #[must_use]
    pub fn for_target(mut self, batch: BatchId, target: impl Into<String>) -> Self {
        self.batch_id = Some(batch);
        self.target = Some(target.into());
        self
    }

    /// With structured context
    #[inline]
    #[must_use]
    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Unit id this execution is (or will be) driven by
    #[inline]
    #[must_use]
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
            .clone()
            .unwrap_or_else(|| UnitId::for_execution(self.id))
    }

    /// Apply a lifecycle transition, stamping timestamps
    ///
    /// # Errors
    /// Returns the rejected `(from, to)` pair if the lifecycle forbids it.
    pub fn transition(
        &mut self,
        next: ExecutionStatus,
    ) -> Result<(), (ExecutionStatus, ExecutionStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

/// Terminal result kind reported by a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Research accepted
    Success,
    /// Unit failed fatally
    Failed,
    /// Unit stopped by cancellation
    Canceled,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Result part of a completion callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    /// Terminal kind
    pub kind: ResultKind,
    /// Error text, for failed and canceled units
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitResult {
    /// Successful result
    #[inline]
    #[must_use]
    pub fn success() -> Self {
        Self {
            kind: ResultKind::Success,
            error: None,
        }
    }

    /// Failed result with error text
    #[inline]
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Failed,
            error: Some(error.into()),
        }
    }

    /// Canceled result with error text
    #[inline]
    #[must_use]
    pub fn canceled(error: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Canceled,
            error: Some(error.into()),
        }
    }
}

/// Context passed from the dispatcher to a unit and echoed back on completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionContext {
    /// Owning batch
    pub batch_id: BatchId,
    /// Target researched
    pub target: String,
    /// Execution record driven by the unit
    pub task_execution_id: ExecutionId,
    /// Worker slot the unit ran in, if routed through the pool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_slot_id: Option<SlotId>,
}

/// Completion callback payload consumed by the aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    /// Reporting unit
    pub unit_id: UnitId,
    /// Terminal result
    pub result: UnitResult,
    /// Dispatch context
    pub context: CompletionContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("target-{i}")).collect()
    }

    #[test]
    fn batch_id_generation() {
        assert_ne!(BatchId::new(), BatchId::new());
    }

    #[test]
    fn unit_id_is_deterministic_per_execution() {
        let exec = ExecutionId::new();
        assert_eq!(UnitId::for_execution(exec), UnitId::for_execution(exec));
        assert!(UnitId::for_execution(exec).0.starts_with("research-"));
    }

    #[test]
    fn begin_chunk_resets_counter_only_on_new_index() {
        let mut batch = BatchOrchestration::new(UserId::new("u"), "task", targets(4), 2);
        batch.begin_chunk(0, targets(2));
        batch.completed_in_current_chunk = 1;

        batch.begin_chunk(0, targets(2));
        assert_eq!(batch.completed_in_current_chunk, 1);

        batch.begin_chunk(1, targets(2));
        assert_eq!(batch.completed_in_current_chunk, 0);
        assert_eq!(batch.current_chunk_size(), 2);
    }

    #[test]
    fn final_status_fails_only_when_every_target_failed() {
        let mut batch = BatchOrchestration::new(UserId::new("u"), "task", targets(2), 2);
        batch.failed_count = 1;
        batch.completed_count = 1;
        assert_eq!(batch.final_status(), BatchStatus::Completed);

        batch.completed_count = 0;
        batch.failed_count = 2;
        assert_eq!(batch.final_status(), BatchStatus::Failed);
    }

    #[test]
    fn execution_lifecycle_never_reopens() {
        let mut exec = TaskExecution::queued("prompt");
        assert!(exec.transition(ExecutionStatus::Running).is_ok());
        assert!(exec.started_at.is_some());
        assert!(exec.transition(ExecutionStatus::Completed).is_ok());
        assert!(exec.completed_at.is_some());

        assert_eq!(
            exec.transition(ExecutionStatus::Running),
            Err((ExecutionStatus::Completed, ExecutionStatus::Running))
        );
    }

    #[test]
    fn queued_execution_can_fail_directly() {
        let mut exec = TaskExecution::queued("prompt");
        assert!(exec.transition(ExecutionStatus::Failed).is_ok());
        assert!(exec.status.is_terminal());
    }

    #[test]
    fn completion_event_wire_shape() {
        let event = CompletionEvent {
            unit_id: UnitId("research-x".to_string()),
            result: UnitResult::failed("boom"),
            context: CompletionContext {
                batch_id: BatchId::new(),
                target: "Acme".to_string(),
                task_execution_id: ExecutionId::new(),
                queue_slot_id: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["unitId"], "research-x");
        assert_eq!(json["result"]["kind"], "failed");
        assert_eq!(json["result"]["error"], "boom");
        assert_eq!(json["context"]["target"], "Acme");
        assert!(json["context"].get("queueSlotId").is_none());
        assert!(json["context"].get("taskExecutionId").is_some());
    }
}
