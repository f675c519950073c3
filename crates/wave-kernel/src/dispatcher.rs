//! Chunk dispatcher
//!
//! Turns one wave of targets into durable execution records and scheduled
//! units. Records are always written before the unit is scheduled, so a crash
//! in between leaves a `queued` execution that a resumed dispatch picks up.

use crate::aggregator::CompletionSink;
use crate::error::DispatchError;
use crate::unit::{terminal_result, UnitLaunch};
use async_trait::async_trait;
use std::sync::Arc;
use wave_core::{
    modify_execution, BatchId, BatchOrchestration, CompletionEvent, ExecutionStatus, Modify,
    OutputSchema, ResultRow, Store, StoreError, TaskContext, TaskExecution, UnitResult,
};

/// Runs scheduled units somewhere
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Queue a unit; returns once it is accepted, not once it finishes
    async fn schedule(&self, launch: UnitLaunch) -> Result<(), DispatchError>;
}

/// What one dispatch call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// New executions created and scheduled
    pub scheduled: usize,
    /// Existing open executions scheduled again
    pub rescheduled: usize,
    /// Terminal executions whose result was reported again
    pub re_reported: usize,
    /// Targets that failed before their unit could start
    pub failed: usize,
}

/// Combined research prompt for one target
#[must_use]
pub fn research_prompt(task: &str, target: &str) -> String {
    format!("{task}\n\nTarget: {target}")
}

/// Chunk dispatcher
pub struct Dispatcher {
    store: Arc<dyn Store>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn CompletionSink>,
}

impl Dispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        Self {
            store,
            scheduler,
            sink,
        }
    }

    /// Dispatch one wave of `batch_id`
    ///
    /// Idempotent per (batch, target): an existing execution is never
    /// recreated. Per-target failures are reported as failed units and do not
    /// abort the wave.
    ///
    /// # Errors
    /// Only when the batch itself cannot be loaded.
    pub async fn dispatch(
        &self,
        batch_id: BatchId,
        targets: &[String],
        task: &str,
    ) -> Result<DispatchReport, DispatchError> {
        let batch = self.store.batch(batch_id).await?;
        let schema = match batch.schema_id {
            Some(schema) => Some(self.store.schema(schema).await?),
            None => None,
        };
        let mut report = DispatchReport::default();

        for target in targets {
            match self.store.find_execution(batch_id, target).await? {
                Some(existing) => self.redispatch(&batch, existing, target, &mut report).await,
                None => {
                    let execution = TaskExecution::queued(research_prompt(task, target))
                        .for_target(batch_id, target.clone())
                        .with_context(TaskContext {
                            target_name: target.clone(),
                            output_shape: schema.as_ref().map(OutputSchema::field_names),
                        });
                    let launch = UnitLaunch::new(&batch, &execution, target);

                    let created = self.create_records(batch_id, execution, schema.as_ref()).await;
                    let scheduled = match created {
                        Ok(()) => self.scheduler.schedule(launch.clone()).await,
                        Err(e) => Err(e.into()),
                    };
                    match scheduled {
                        Ok(()) => report.scheduled += 1,
                        Err(e) => {
                            self.fail_target(&launch, &e.to_string()).await;
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        tracing::info!(
            batch_id = %batch_id,
            scheduled = report.scheduled,
            rescheduled = report.rescheduled,
            re_reported = report.re_reported,
            failed = report.failed,
            "chunk dispatched"
        );
        Ok(report)
    }

    async fn create_records(
        &self,
        batch_id: BatchId,
        execution: TaskExecution,
        schema: Option<&OutputSchema>,
    ) -> Result<(), StoreError> {
        let execution = self.store.insert_execution(execution).await?;
        if let (Some(schema), Some(target)) = (schema, execution.target.as_deref()) {
            let row = ResultRow::placeholder(schema, batch_id, target, execution.id);
            self.store.insert_row(row).await?;
        }
        Ok(())
    }

    async fn redispatch(
        &self,
        batch: &BatchOrchestration,
        existing: TaskExecution,
        target: &str,
        report: &mut DispatchReport,
    ) {
        let launch = UnitLaunch::new(batch, &existing, target);
        if let Some(result) = terminal_result(&existing) {
            tracing::debug!(target = %target, "execution already terminal, re-reporting");
            self.report(launch.event(result, None)).await;
            report.re_reported += 1;
            return;
        }
        tracing::info!(target = %target, status = %existing.status, "rescheduling open execution");
        match self.scheduler.schedule(launch.clone()).await {
            Ok(()) => report.rescheduled += 1,
            Err(e) => {
                self.fail_target(&launch, &e.to_string()).await;
                report.failed += 1;
            }
        }
    }

    async fn fail_target(&self, launch: &UnitLaunch, error: &str) {
        tracing::error!(target = %launch.context.target, error = %error, "dispatch failed");
        let marked = modify_execution(
            self.store.as_ref(),
            launch.context.task_execution_id,
            |e| {
                if e.status.is_terminal() {
                    return Ok(Modify::Skip(()));
                }
                e.error = Some(error.to_string());
                e.transition(ExecutionStatus::Failed)?;
                Ok(Modify::Write(()))
            },
        )
        .await;
        if let Err(e) = marked {
            tracing::warn!(target = %launch.context.target, error = %e, "could not mark execution failed");
        }
        self.report(launch.event(UnitResult::failed(error), None)).await;
    }

    async fn report(&self, event: CompletionEvent) {
        let unit_id = event.unit_id.clone();
        if let Err(e) = self.sink.report(event).await {
            tracing::error!(unit_id = %unit_id, error = %e, "completion report failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Transition;
    use parking_lot::Mutex;
    use wave_core::{MemoryStore, UserId};

    #[derive(Default)]
    struct RecordingScheduler {
        launches: Mutex<Vec<UnitLaunch>>,
        refuse: bool,
    }

    #[async_trait]
    impl Scheduler for RecordingScheduler {
        async fn schedule(&self, launch: UnitLaunch) -> Result<(), DispatchError> {
            if self.refuse {
                return Err(crate::error::PoolError::Closed.into());
            }
            self.launches.lock().push(launch);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<CompletionEvent>>,
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn report(&self, event: CompletionEvent) -> Result<Transition, StoreError> {
            self.events.lock().push(event);
            Ok(Transition::Counted {
                chunk_complete: false,
                wave_signal: false,
                batch_complete: false,
            })
        }
    }

    struct Fixture {
        store: Arc<dyn Store>,
        scheduler: Arc<RecordingScheduler>,
        sink: Arc<RecordingSink>,
        dispatcher: Dispatcher,
    }

    fn fixture(refuse: bool) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(RecordingScheduler {
            refuse,
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(store.clone(), scheduler.clone(), sink.clone());
        Fixture {
            store,
            scheduler,
            sink,
            dispatcher,
        }
    }

    fn targets() -> Vec<String> {
        vec!["Acme".to_string(), "Globex".to_string()]
    }

    #[tokio::test]
    async fn creates_queued_records_before_scheduling() {
        let f = fixture(false);
        let batch = f
            .store
            .insert_batch(BatchOrchestration::new(UserId::new("u"), "Find HQ", targets(), 2))
            .await
            .unwrap();

        let report = f.dispatcher.dispatch(batch.id, &targets(), "Find HQ").await.unwrap();
        assert_eq!(report.scheduled, 2);

        let launches = f.scheduler.launches.lock().clone();
        assert_eq!(launches.len(), 2);
        for launch in launches {
            let exec = f
                .store
                .execution(launch.context.task_execution_id)
                .await
                .unwrap();
            assert_eq!(exec.status, ExecutionStatus::Queued);
            assert!(exec.prompt.contains("Find HQ"));
            assert!(exec.prompt.contains(&launch.context.target));
            assert_eq!(launch.unit_id, exec.unit_id());
        }
    }

    #[tokio::test]
    async fn schema_batches_get_placeholder_rows() {
        let f = fixture(false);
        let schema = OutputSchema::new("s").field("hq", "").field("ceo", "");
        let schema_id = schema.id;
        f.store.insert_schema(schema).await.unwrap();
        let batch = f
            .store
            .insert_batch(
                BatchOrchestration::new(UserId::new("u"), "t", targets(), 2).with_schema(schema_id),
            )
            .await
            .unwrap();

        f.dispatcher.dispatch(batch.id, &targets(), "t").await.unwrap();

        let exec = f.store.find_execution(batch.id, "Acme").await.unwrap().unwrap();
        let row = f.store.row_for_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(row.cells.len(), 2);
        assert_eq!(row.filled(), 0);
        assert_eq!(
            exec.context.unwrap().output_shape,
            Some(vec!["hq".to_string(), "ceo".to_string()])
        );
    }

    #[tokio::test]
    async fn second_dispatch_does_not_recreate_records() {
        let f = fixture(false);
        let batch = f
            .store
            .insert_batch(BatchOrchestration::new(UserId::new("u"), "t", targets(), 2))
            .await
            .unwrap();
        f.dispatcher.dispatch(batch.id, &targets(), "t").await.unwrap();

        // Finish one target, leave the other open
        let done = f.store.find_execution(batch.id, "Acme").await.unwrap().unwrap();
        modify_execution(f.store.as_ref(), done.id, |e| {
            e.transition(ExecutionStatus::Running)?;
            e.transition(ExecutionStatus::Completed)?;
            Ok(Modify::Write(()))
        })
        .await
        .unwrap();

        let report = f.dispatcher.dispatch(batch.id, &targets(), "t").await.unwrap();
        assert_eq!(report.scheduled, 0);
        assert_eq!(report.re_reported, 1);
        assert_eq!(report.rescheduled, 1);
        assert_eq!(f.store.executions_for_batch(batch.id).await.unwrap().len(), 2);

        let events = f.sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].unit_id, done.unit_id());
        assert_eq!(events[0].result, UnitResult::success());

        // Acme was re-reported, only Globex went back to the scheduler
        let launches = f.scheduler.launches.lock().clone();
        assert_eq!(launches.len(), 3);
        assert_eq!(launches[1].unit_id, launches[2].unit_id);
    }

    #[tokio::test]
    async fn refused_schedule_fails_the_target_only() {
        let f = fixture(true);
        let batch = f
            .store
            .insert_batch(BatchOrchestration::new(UserId::new("u"), "t", targets(), 2))
            .await
            .unwrap();

        let report = f.dispatcher.dispatch(batch.id, &targets(), "t").await.unwrap();
        assert_eq!(report.failed, 2);

        let exec = f.store.find_execution(batch.id, "Globex").await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.unwrap().contains("shut down"));
        assert_eq!(f.sink.events.lock().len(), 2);
    }
}
