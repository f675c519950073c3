//! Kernel error types

use wave_core::{AgentError, ChunkError, StoreError, ThreadError, UserId};

/// Error text recorded on executions stopped by a batch cancel
pub const CANCELLED_BY_CALLER: &str = "cancelled by caller";

/// Unit-of-work errors
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// Agent failed too many steps in a row
    #[error("agent failed {errors} consecutive steps, last error: {last}")]
    StepsExhausted {
        /// Consecutive failures
        errors: u32,
        /// Last step error
        last: AgentError,
    },

    /// Batch cancelled or execution closed underneath the unit
    #[error("cancelled by caller")]
    Cancelled,

    /// Batch has a schema but the unit has no result row
    #[error("dataset batch without a result row for execution")]
    MissingRow,

    /// Thread backend failure
    #[error(transparent)]
    Thread(#[from] ThreadError),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UnitError {
    /// Cancellation is reported as `canceled`, everything else as `failed`
    #[inline]
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Scheduling errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Worker pool refused the unit
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Persistence failure while preparing the chunk
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Worker pool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// Pool was shut down
    #[error("worker pool is shut down")]
    Closed,

    /// User slot semaphore closed while the unit was queued
    #[error("worker slots for {0} were closed")]
    SlotsClosed(UserId),
}

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Batch request has no targets
    #[error("batch has no targets")]
    NoTargets,

    /// Target listed more than once; executions are keyed by (batch, target)
    #[error("target '{0}' appears more than once")]
    DuplicateTarget(String),

    /// Invalid wave size
    #[error(transparent)]
    Chunking(#[from] ChunkError),

    /// Dispatch of a whole chunk failed
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Conflicts that outlived the retry loop may succeed on a later attempt
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) | Self::Dispatch(DispatchError::Store(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_text_matches_constant() {
        assert_eq!(UnitError::Cancelled.to_string(), CANCELLED_BY_CALLER);
        assert!(UnitError::Cancelled.is_cancellation());
    }

    #[test]
    fn exhausted_steps_carry_last_error() {
        let err = UnitError::StepsExhausted {
            errors: 3,
            last: AgentError::Provider("rate limited".into()),
        };
        assert!(err.to_string().contains("3 consecutive"));
        assert!(err.to_string().contains("rate limited"));
        assert!(!err.is_cancellation());
    }

    #[test]
    fn store_conflicts_are_retryable() {
        let err = OrchestratorError::Store(StoreError::RevisionConflict {
            expected: 1,
            actual: 3,
        });
        assert!(err.is_retryable());
        assert!(!OrchestratorError::NoTargets.is_retryable());
    }
}
