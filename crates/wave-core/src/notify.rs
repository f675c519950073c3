//! Batch finalization notices

use crate::error::NotifyError;
use crate::thread::{Conversations, Role};
use crate::types::{BatchId, BatchOrchestration, BatchStatus, ThreadId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Outcome counts posted once a batch finalizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Final status
    pub status: BatchStatus,
    /// Number of targets
    pub total: usize,
    /// Targets researched successfully
    pub completed: usize,
    /// Targets that failed or were cancelled
    pub failed: usize,
    /// Orchestrator-level error, if any
    pub error: Option<String>,
}

impl BatchSummary {
    /// Summarize a batch record
    #[must_use]
    pub fn of(batch: &BatchOrchestration) -> Self {
        Self {
            batch_id: batch.id,
            status: batch.status,
            total: batch.total(),
            completed: batch.completed_count,
            failed: batch.failed_count,
            error: batch.error.clone(),
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headline = match self.status {
            BatchStatus::Completed if self.failed == 0 => "Batch research finished",
            BatchStatus::Completed => "Batch research finished with partial success",
            BatchStatus::Failed => "Batch research failed",
            BatchStatus::Cancelled => "Batch research cancelled",
            BatchStatus::Running => "Batch research in progress",
        };
        write!(
            f,
            "{headline}: {} of {} targets completed, {} failed.",
            self.completed, self.total, self.failed
        )?;
        if let Some(error) = &self.error {
            write!(f, " Error: {error}")?;
        }
        Ok(())
    }
}

/// Destination for finalization summaries
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post the summary, to `thread` when the batch has one
    async fn post(&self, thread: Option<ThreadId>, summary: &BatchSummary)
        -> Result<(), NotifyError>;
}

/// Posts summaries into the batch's conversation thread
pub struct ThreadNotifier {
    conversations: Arc<dyn Conversations>,
}

impl ThreadNotifier {
    /// Create a notifier over a thread backend
    #[must_use]
    pub fn new(conversations: Arc<dyn Conversations>) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl Notifier for ThreadNotifier {
    async fn post(
        &self,
        thread: Option<ThreadId>,
        summary: &BatchSummary,
    ) -> Result<(), NotifyError> {
        let Some(thread) = thread else {
            tracing::info!(batch_id = %summary.batch_id, "{summary}");
            return Ok(());
        };
        self.conversations
            .append(thread, Role::System, &summary.to_string())
            .await
            .map(|_| ())
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }
}

/// Writes summaries to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn post(
        &self,
        _thread: Option<ThreadId>,
        summary: &BatchSummary,
    ) -> Result<(), NotifyError> {
        tracing::info!(batch_id = %summary.batch_id, status = %summary.status, "{summary}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::MemoryConversations;
    use crate::types::UserId;

    fn summary(status: BatchStatus, completed: usize, failed: usize) -> BatchSummary {
        let mut batch = BatchOrchestration::new(
            UserId::new("u"),
            "t",
            (0..completed + failed).map(|i| i.to_string()).collect(),
            2,
        );
        batch.status = status;
        batch.completed_count = completed;
        batch.failed_count = failed;
        BatchSummary::of(&batch)
    }

    #[test]
    fn message_reports_partial_success_counts() {
        let text = summary(BatchStatus::Completed, 4, 1).to_string();
        assert!(text.contains("partial success"));
        assert!(text.contains("4 of 5 targets completed, 1 failed"));
    }

    #[test]
    fn message_for_failed_batch() {
        let text = summary(BatchStatus::Failed, 0, 3).to_string();
        assert!(text.starts_with("Batch research failed"));
    }

    #[tokio::test]
    async fn thread_notifier_appends_system_message() {
        let conv = Arc::new(MemoryConversations::new());
        let thread = conv.create_thread("batch", None).await.unwrap();
        let notifier = ThreadNotifier::new(conv.clone());

        notifier
            .post(Some(thread), &summary(BatchStatus::Completed, 2, 0))
            .await
            .unwrap();

        let messages = conv.messages(thread).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("2 of 2"));
    }
}
