//! Per-user worker slots

mod common;

use async_trait::async_trait;
use common::{config, Harness, OWNER};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use wave_core::{
    BatchOrchestration, BatchStatus, CompletionEvent, ExecutionStatus, MemoryConversations,
    MemoryStore, ResultKind, StepOutcome, Store, StoreError, TaskExecution, UserId,
};
use wave_kernel::{
    BatchRequest, CompletionSink, Ignored, Scheduler, Transition, UnitLaunch, UnitRunner,
    WorkerPool,
};
use wave_test_utils::{targets, Gate, ScriptedAgent, ScriptedReviewer, Step};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn units_queue_behind_the_owners_slots() {
    let gate = Gate::new();
    let h = Harness::with_config(
        ScriptedAgent::repeating(Step::Wait(gate.clone(), StepOutcome::stop("done"))),
        ScriptedReviewer::passing(),
        config().with_worker_slots(2),
    );
    let orchestrator = h.engine.orchestrator().clone();
    let request = h.request(targets(5), 5);
    let driver = tokio::spawn(async move { orchestrator.run(request).await });

    tokio::time::timeout(Duration::from_secs(5), gate.wait_entered(2))
        .await
        .unwrap();
    settle().await;
    assert_eq!(gate.entered(), 2);
    let stats = h.engine.pool().stats();
    assert_eq!(stats.active, 2);
    assert_eq!(stats.queued, 3);
    assert_eq!(h.engine.pool().available_slots(&UserId::new(OWNER)), 0);

    gate.open();
    let outcome = driver.await.unwrap().unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.batch.completed_count, 5);
    let stats = h.engine.pool().stats();
    assert_eq!(stats.peak_active, 2);
    assert_eq!(stats.finished, 5);
    assert_eq!(stats.active + stats.queued, 0);
}

#[tokio::test]
async fn owners_do_not_share_slots() {
    let gate = Gate::new();
    let h = Harness::with_config(
        ScriptedAgent::repeating(Step::Wait(gate.clone(), StepOutcome::stop("done"))),
        ScriptedReviewer::passing(),
        config().with_worker_slots(1),
    );

    let mut drivers = Vec::new();
    for owner in ["ana", "ben"] {
        let orchestrator = h.engine.orchestrator().clone();
        let request = BatchRequest::new(UserId::new(owner), "task", targets(2))
            .with_concurrency_limit(2);
        drivers.push(tokio::spawn(async move { orchestrator.run(request).await }));
    }

    // One unit per owner runs even though each owner has a single slot
    tokio::time::timeout(Duration::from_secs(5), gate.wait_entered(2))
        .await
        .unwrap();
    settle().await;
    assert_eq!(gate.entered(), 2);
    assert_eq!(h.engine.pool().available_slots(&UserId::new("ana")), 0);
    assert_eq!(h.engine.pool().available_slots(&UserId::new("ben")), 0);
    assert_eq!(h.engine.pool().available_slots(&UserId::new("cy")), 1);

    gate.open();
    for driver in drivers {
        assert!(driver.await.unwrap().unwrap().success);
    }
}

#[tokio::test]
async fn shutdown_fails_queued_units_and_refuses_new_ones() {
    let gate = Gate::new();
    let h = Harness::with_config(
        ScriptedAgent::repeating(Step::Wait(gate.clone(), StepOutcome::stop("done"))),
        ScriptedReviewer::passing(),
        config().with_worker_slots(1),
    );
    let orchestrator = h.engine.orchestrator().clone();
    let request = h.request(targets(3), 3);
    let driver = tokio::spawn(async move { orchestrator.run(request).await });

    tokio::time::timeout(Duration::from_secs(5), gate.wait_entered(1))
        .await
        .unwrap();
    h.engine.pool().shutdown();
    gate.open();

    let outcome = driver.await.unwrap().unwrap();
    assert_eq!(outcome.batch.status, BatchStatus::Completed);
    assert_eq!(outcome.batch.completed_count, 1);
    assert_eq!(outcome.batch.failed_count, 2);
    assert_eq!(h.engine.pool().stats().rejected, 2);
    for t in &targets(3)[1..] {
        let exec = h.execution(outcome.batch.id, t).await;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.unwrap().contains("closed"));
    }

    // Closed pool refuses new units; the dispatcher fails them in place
    let outcome = h.run(h.request(targets(2), 2)).await;
    assert!(!outcome.success);
    assert_eq!(outcome.batch.status, BatchStatus::Failed);
    assert_eq!(outcome.batch.failed_count, 2);
    let exec = h.execution(outcome.batch.id, "company-1").await;
    assert!(exec.error.unwrap().contains("shut down"));
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<CompletionEvent>>,
    arrived: Notify,
}

#[async_trait]
impl CompletionSink for RecordingSink {
    async fn report(&self, event: CompletionEvent) -> Result<Transition, StoreError> {
        self.events.lock().push(event);
        self.arrived.notify_one();
        Ok(Transition::Ignored(Ignored::AlreadyCounted))
    }
}

#[tokio::test]
async fn completions_carry_the_slot_id() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let runner = Arc::new(UnitRunner::new(
        store.clone(),
        Arc::new(ScriptedAgent::answering("done")),
        Arc::new(ScriptedReviewer::passing()),
        Arc::new(MemoryConversations::new()),
        sink.clone(),
        config(),
    ));
    let pool = WorkerPool::new(runner, 1);

    let batch = store
        .insert_batch(BatchOrchestration::new(UserId::new(OWNER), "task", targets(1), 1))
        .await
        .unwrap();
    let exec = store
        .insert_execution(TaskExecution::queued("task company-1").for_target(batch.id, "company-1"))
        .await
        .unwrap();
    pool.schedule(UnitLaunch::new(&batch, &exec, "company-1"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), sink.arrived.notified())
        .await
        .unwrap();
    let events = sink.events.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].result.kind, ResultKind::Success);
    assert!(events[0].context.queue_slot_id.is_some());
    assert_eq!(events[0].context.task_execution_id, exec.id);
    assert_eq!(
        store.execution(exec.id).await.unwrap().status,
        ExecutionStatus::Completed
    );
}
