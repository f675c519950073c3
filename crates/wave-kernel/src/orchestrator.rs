//! Batch orchestrator
//!
//! One orchestrator drives one batch through its waves. All of its progress
//! lives on the batch record (chunk cursor, dispatched chunks, signalled
//! chunk), so a restarted process resumes from the record and the dispatcher
//! and aggregator absorb any repeated work.

use crate::dispatcher::Dispatcher;
use crate::error::{OrchestratorError, CANCELLED_BY_CALLER};
use crate::signal::SignalBus;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use wave_core::{
    modify_batch, modify_execution, plan_chunks, BatchId, BatchOrchestration, BatchStatus,
    BatchSummary, EngineConfig, ExecutionStatus, Modify, Notifier, RubricId, SchemaId, Store,
    StoreError, ThreadId, UserId,
};

/// New batch submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    /// Owner, selects the worker-pool partition
    pub owner: UserId,
    /// Research instruction shared by every target
    pub task: String,
    /// Ordered targets
    pub targets: Vec<String>,
    /// Wave size, the engine default when unset
    pub concurrency_limit: Option<usize>,
    /// Structured-output schema
    pub schema: Option<SchemaId>,
    /// Review rubric, derived from the schema when unset
    pub rubric: Option<RubricId>,
    /// Thread receiving the final summary
    pub notify_thread: Option<ThreadId>,
}

impl BatchRequest {
    /// Request for `targets`
    #[must_use]
    pub fn new(owner: UserId, task: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            owner,
            task: task.into(),
            targets,
            concurrency_limit: None,
            schema: None,
            rubric: None,
            notify_thread: None,
        }
    }

    /// With an explicit wave size
    #[inline]
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// With structured output
    #[inline]
    #[must_use]
    pub fn with_schema(mut self, schema: SchemaId) -> Self {
        self.schema = Some(schema);
        self
    }

    /// With an explicit rubric
    #[inline]
    #[must_use]
    pub fn with_rubric(mut self, rubric: RubricId) -> Self {
        self.rubric = Some(rubric);
        self
    }

    /// With a notification thread
    #[inline]
    #[must_use]
    pub fn with_notify_thread(mut self, thread: ThreadId) -> Self {
        self.notify_thread = Some(thread);
        self
    }
}

/// Final state of a driven batch
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Batch completed with at least one successful target
    pub success: bool,
    /// Batch record after finalization
    pub batch: BatchOrchestration,
}

impl RunOutcome {
    fn of(batch: BatchOrchestration) -> Self {
        Self {
            success: batch.status == BatchStatus::Completed,
            batch,
        }
    }
}

/// What a cancel call changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReport {
    /// Cancelled batch
    pub batch_id: BatchId,
    /// False when the batch was already terminal
    pub cancelled: bool,
    /// Open executions closed as failed
    pub executions_closed: usize,
}

/// Batch orchestrator
pub struct Orchestrator {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    signals: Arc<SignalBus>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl Orchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        signals: Arc<SignalBus>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            signals,
            notifier,
            config,
        }
    }

    /// Validate and persist a new batch without driving it
    ///
    /// # Errors
    /// - `OrchestratorError::NoTargets` for an empty target list
    /// - `OrchestratorError::DuplicateTarget` when a target is listed twice
    /// - `OrchestratorError::Chunking` for a zero wave size
    pub async fn submit(
        &self,
        request: BatchRequest,
    ) -> Result<BatchOrchestration, OrchestratorError> {
        if request.targets.is_empty() {
            return Err(OrchestratorError::NoTargets);
        }
        let mut seen = HashSet::with_capacity(request.targets.len());
        if let Some(repeated) = request.targets.iter().find(|t| !seen.insert(t.as_str())) {
            return Err(OrchestratorError::DuplicateTarget(repeated.clone()));
        }
        let limit = request
            .concurrency_limit
            .unwrap_or(self.config.default_concurrency_limit);
        let waves = plan_chunks(&request.targets, limit)?.len();

        let mut batch =
            BatchOrchestration::new(request.owner, request.task, request.targets, limit);
        batch.schema_id = request.schema;
        batch.rubric_id = request.rubric;
        batch.notify_thread = request.notify_thread;
        let batch = self.store.insert_batch(batch).await?;

        tracing::info!(
            batch_id = %batch.id,
            owner = %batch.owner,
            targets = batch.total(),
            limit,
            waves,
            "batch submitted"
        );
        Ok(batch)
    }

    /// Submit and drive a batch to a terminal state
    ///
    /// # Errors
    /// Submission errors, or an orchestrator-level failure (the batch is
    /// marked failed first).
    pub async fn run(&self, request: BatchRequest) -> Result<RunOutcome, OrchestratorError> {
        let batch = self.submit(request).await?;
        self.drive(batch.id).await
    }

    /// Drive an existing batch from wherever its record says it is
    ///
    /// # Errors
    /// See [`Orchestrator::run`].
    pub async fn resume(&self, batch_id: BatchId) -> Result<RunOutcome, OrchestratorError> {
        tracing::info!(batch_id = %batch_id, "resuming batch");
        self.drive(batch_id).await
    }

    /// Resume every batch still marked running
    ///
    /// # Errors
    /// Only when the running batches cannot be listed; per-batch outcomes
    /// are returned individually.
    pub async fn resume_all(
        &self,
    ) -> Result<Vec<(BatchId, Result<RunOutcome, OrchestratorError>)>, OrchestratorError> {
        let running = self.store.running_batches().await?;
        tracing::info!(batches = running.len(), "resuming running batches");
        let drives = running.iter().map(|b| async move { (b.id, self.drive(b.id).await) });
        Ok(join_all(drives).await)
    }

    /// Cancel a batch
    ///
    /// Flips the batch to cancelled, closes every open execution as failed
    /// and wakes the orchestrator. Units still running notice at their next
    /// checkpoint. Cancelling a terminal batch changes nothing.
    ///
    /// # Errors
    /// Store failures.
    pub async fn cancel(&self, batch_id: BatchId) -> Result<CancelReport, OrchestratorError> {
        let (_, cancelled) = modify_batch(self.store.as_ref(), batch_id, |b| {
            if b.status.is_terminal() {
                return Modify::Skip(false);
            }
            b.status = BatchStatus::Cancelled;
            b.finished_at = Some(Utc::now());
            Modify::Write(true)
        })
        .await?;

        let mut executions_closed = 0;
        if cancelled {
            for execution in self.store.executions_for_batch(batch_id).await? {
                if execution.status.is_terminal() {
                    continue;
                }
                let (_, closed) = modify_execution(self.store.as_ref(), execution.id, |e| {
                    if e.status.is_terminal() {
                        return Ok(Modify::Skip(false));
                    }
                    e.error = Some(CANCELLED_BY_CALLER.to_string());
                    e.progress_label = Some("cancelled".to_string());
                    e.transition(ExecutionStatus::Failed)?;
                    Ok(Modify::Write(true))
                })
                .await?;
                if closed {
                    executions_closed += 1;
                }
            }
            self.signals.wake(batch_id);
        }

        tracing::info!(batch_id = %batch_id, cancelled, executions_closed, "batch cancel");
        Ok(CancelReport {
            batch_id,
            cancelled,
            executions_closed,
        })
    }

    async fn drive(&self, batch_id: BatchId) -> Result<RunOutcome, OrchestratorError> {
        let batch = self.store.batch(batch_id).await?;
        if batch.status.is_terminal() {
            tracing::debug!(batch_id = %batch_id, status = %batch.status, "batch already finalized");
            return Ok(RunOutcome::of(batch));
        }

        let waves = self.run_waves(batch_id).await;

        let finalized = match &waves {
            Ok(_) => self.finalize(batch_id, None).await,
            Err(e) => {
                tracing::error!(batch_id = %batch_id, error = %e, "orchestrator failed");
                self.finalize(batch_id, Some(e.to_string())).await
            }
        };
        let delivered = self.signals.forget(batch_id);

        let batch = finalized?;
        if delivered != batch.wave_signals_fired {
            tracing::debug!(
                batch_id = %batch_id,
                delivered,
                recorded = batch.wave_signals_fired,
                "wave signal count differs from the batch record, batch was resumed"
            );
        }
        self.post_summary(&batch).await;
        match waves {
            // Cancellation can surface as an error from a racing write; the
            // record is authoritative
            Err(e) if batch.status != BatchStatus::Cancelled => Err(e),
            _ => Ok(RunOutcome::of(batch)),
        }
    }

    async fn run_waves(&self, batch_id: BatchId) -> Result<(), OrchestratorError> {
        let batch = self.store.batch(batch_id).await?;
        let chunks = plan_chunks(&batch.targets, batch.concurrency_limit)?;
        let last = chunks.len().saturating_sub(1);
        let start = batch.current_chunk.as_ref().map_or(0, |c| c.index);

        for chunk in chunks.into_iter().skip(start) {
            let index = chunk.index;
            let (batch, active) = modify_batch(self.store.as_ref(), batch_id, |b| {
                if b.status.is_terminal() {
                    return Modify::Skip(false);
                }
                if b.current_chunk.as_ref().is_some_and(|c| c.index == index) {
                    return Modify::Skip(true);
                }
                b.begin_chunk(index, chunk.targets.clone());
                Modify::Write(true)
            })
            .await?;
            if !active {
                return Ok(());
            }

            tracing::info!(
                batch_id = %batch_id,
                chunk = index,
                size = chunk.len(),
                resumed = batch.dispatched_chunks.contains(&index),
                "dispatching wave"
            );
            self.dispatcher
                .dispatch(batch_id, &chunk.targets, &batch.task)
                .await?;
            self.mark_dispatched(batch_id, index).await?;

            if index < last {
                let batch = self.wait_for(batch_id, |b| b.wave_signalled(index)).await?;
                if batch.status.is_terminal() {
                    return Ok(());
                }
                tracing::info!(batch_id = %batch_id, chunk = index, "wave complete");
            }
        }

        // Last wave: wait for the counters, not for a wave signal
        self.wait_for(batch_id, BatchOrchestration::is_fully_accounted)
            .await?;
        Ok(())
    }

    async fn mark_dispatched(&self, batch_id: BatchId, index: usize) -> Result<(), StoreError> {
        let marked = modify_batch(self.store.as_ref(), batch_id, |b| {
            if b.status.is_terminal() || b.dispatched_chunks.contains(&index) {
                return Modify::Skip(());
            }
            b.dispatched_chunks.insert(index);
            Modify::Write(())
        })
        .await;
        match marked {
            Ok(_) | Err(StoreError::BatchFinalized(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_for<F>(
        &self,
        batch_id: BatchId,
        ready: F,
    ) -> Result<BatchOrchestration, OrchestratorError>
    where
        F: Fn(&BatchOrchestration) -> bool,
    {
        let channel = self.signals.channel(batch_id);
        let poll = self.config.wave_poll_interval();
        loop {
            let batch = self.store.batch(batch_id).await?;
            if batch.status.is_terminal() || ready(&batch) {
                return Ok(batch);
            }
            if tokio::time::timeout(poll, channel.notified()).await.is_err() {
                tracing::debug!(
                    batch_id = %batch_id,
                    accounted = batch.accounted(),
                    total = batch.total(),
                    "no wake-up within poll interval, re-reading batch"
                );
            }
        }
    }

    async fn finalize(
        &self,
        batch_id: BatchId,
        error: Option<String>,
    ) -> Result<BatchOrchestration, OrchestratorError> {
        let (batch, written) = modify_batch(self.store.as_ref(), batch_id, |b| {
            if b.status.is_terminal() {
                return Modify::Skip(false);
            }
            b.status = if error.is_some() {
                BatchStatus::Failed
            } else {
                b.final_status()
            };
            b.error.clone_from(&error);
            b.finished_at = Some(Utc::now());
            Modify::Write(true)
        })
        .await?;
        if written {
            tracing::info!(
                batch_id = %batch_id,
                status = %batch.status,
                completed = batch.completed_count,
                failed = batch.failed_count,
                wave_signals = batch.wave_signals_fired,
                "batch finalized"
            );
        }
        Ok(batch)
    }

    async fn post_summary(&self, batch: &BatchOrchestration) {
        let summary = BatchSummary::of(batch);
        if let Err(e) = self.notifier.post(batch.notify_thread, &summary).await {
            tracing::warn!(batch_id = %batch.id, error = %e, "summary notification failed");
        }
    }
}
