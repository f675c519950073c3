//! Error types for Wave Core
//!
//! One enum per collaborator boundary:
//! - Wave planning
//! - Persistence (including optimistic-concurrency conflicts)
//! - Agent steps, reviews, threads and notifications
//! - Delegation limits
//! - Configuration

use crate::types::{BatchId, ExecutionId, ExecutionStatus, RowId, RubricId, SchemaId, ThreadId};
use std::path::PathBuf;

/// Wave planning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// Concurrency limit must be positive
    #[error("concurrency limit must be at least 1")]
    ZeroLimit,
}

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Batch not found
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Execution not found
    #[error("task execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// Result row not found
    #[error("result row not found: {0}")]
    RowNotFound(RowId),

    /// Schema not found
    #[error("schema not found: {0}")]
    SchemaNotFound(SchemaId),

    /// Rubric not found
    #[error("rubric not found: {0}")]
    RubricNotFound(RubricId),

    /// Record already exists
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// Write attempted on a batch that already reached a terminal status
    #[error("batch {0} is finalized and cannot be modified")]
    BatchFinalized(BatchId),

    /// Stale write (optimistic concurrency failure)
    #[error("revision conflict: expected {expected}, found {actual}")]
    RevisionConflict {
        /// Revision the writer read
        expected: u64,
        /// Revision currently stored
        actual: u64,
    },

    /// Unknown schema field on a result row
    #[error("unknown field '{field}' on row {row}")]
    UnknownField {
        /// Row written to
        row: RowId,
        /// Offending field
        field: String,
    },

    /// Forbidden execution lifecycle transition
    #[error("invalid execution transition {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: ExecutionStatus,
        /// Requested status
        to: ExecutionStatus,
    },

    /// Snapshot IO failure
    #[error("io error on {path}: {source}")]
    Io {
        /// Snapshot path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Snapshot encoding failure
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    /// Conflicts are resolved by re-reading and retrying
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RevisionConflict { .. })
    }

    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<(ExecutionStatus, ExecutionStatus)> for StoreError {
    fn from((from, to): (ExecutionStatus, ExecutionStatus)) -> Self {
        Self::InvalidTransition { from, to }
    }
}

/// Errors raised by a single agent step
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// Model provider call failed
    #[error("model call failed: {0}")]
    Provider(String),

    /// Tool invocation failed
    #[error("tool '{tool}' failed: {message}")]
    Tool {
        /// Tool name
        tool: String,
        /// Failure text
        message: String,
    },

    /// Step timed out
    #[error("step timed out after {duration_secs}s")]
    Timeout {
        /// Elapsed seconds
        duration_secs: u64,
    },
}

/// Reviewer call errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReviewError {
    /// Reviewer could not be reached or returned garbage
    #[error("reviewer unavailable: {0}")]
    Unavailable(String),

    /// Rubric cannot be scored (no criteria or zero weight)
    #[error("invalid rubric: {0}")]
    InvalidRubric(String),
}

/// Conversation thread errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ThreadError {
    /// Thread not found
    #[error("thread not found: {0}")]
    NotFound(ThreadId),

    /// Backend failure
    #[error("thread backend failed: {0}")]
    Backend(String),
}

/// Notification errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    /// Delivery failed
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Delegation tree errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegationError {
    /// Tree depth limit reached
    #[error("delegation depth limit reached (max: {0})")]
    DepthExceeded(usize),

    /// Sub-task budget exhausted
    #[error("sub-task limit reached (max: {0})")]
    SubtaskLimit(usize),

    /// Parent thread is not part of the tree
    #[error("unknown parent thread: {0}")]
    UnknownParent(ThreadId),

    /// Thread backend failed while creating the child
    #[error("child thread creation failed: {0}")]
    Thread(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse error
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// IO error reading the config file
    #[error("io error reading {path}: {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Value out of range
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending key
        key: &'static str,
        /// Why it was rejected
        reason: String,
    },
}
