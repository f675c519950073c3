//! Wave Core - batch research domain model
//!
//! Everything the orchestration kernel shares:
//! - Batch, execution and completion-callback records
//! - Wave planning (chunking)
//! - Review gate model (rubrics, scores, feedback messages)
//! - Collaborator contracts: agent, reviewer, threads, notifier
//! - Bounded delegation tree
//! - Optimistic-concurrency stores (memory and JSON snapshot)
//!
//! # Example
//!
//! ```rust,ignore
//! use wave_core::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let batch = BatchOrchestration::new(UserId::new("ana"), "Find HQ city", targets, 5);
//! let batch = store.insert_batch(batch).await?;
//! let waves = plan_chunks(&batch.targets, batch.concurrency_limit)?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod agent;
pub mod chunking;
pub mod config;
pub mod delegation;
pub mod error;
pub mod notify;
pub mod review;
pub mod store;
pub mod thread;
pub mod types;

pub use agent::{
    Agent, FinishReason, PromptRef, StepOutcome, StepRequest, StepScope, ToolHost, ToolSpec,
};
pub use chunking::{chunk_count, plan_chunks, Chunk};
pub use config::EngineConfig;
pub use delegation::{DelegationNode, DelegationPolicy, DelegationTree};
pub use error::{
    AgentError, ChunkError, ConfigError, DelegationError, NotifyError, ReviewError, StoreError,
    ThreadError,
};
pub use notify::{BatchSummary, LogNotifier, Notifier, ThreadNotifier};
pub use review::{
    Criterion, CriterionScore, EntityContext, FieldValues, ReviewResult, Reviewer, Rubric,
};
pub use store::{
    modify_batch, modify_execution, JsonFileStore, MemoryStore, Modify, OutputSchema, ResultRow,
    SchemaField, Store,
};
pub use thread::{Conversations, MemoryConversations, Message, Role, ThreadInfo};
pub use types::{
    BatchId, BatchOrchestration, BatchStatus, ChunkCursor, CompletionContext, CompletionEvent,
    ExecutionId, ExecutionStatus, MessageId, ResultKind, ReviewAttempt, RowId, RubricId, SchemaId,
    SlotId, TaskContext, TaskExecution, ThreadId, UnitId, UnitResult, UserId,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Wave Core
    pub use crate::{
        plan_chunks, Agent, BatchId, BatchOrchestration, BatchStatus, CompletionEvent,
        Conversations, EngineConfig, ExecutionStatus, MemoryStore, Notifier, ResultKind, Reviewer,
        Rubric, Store, TaskExecution, UnitId, UserId,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
