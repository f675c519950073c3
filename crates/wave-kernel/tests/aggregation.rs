//! Completion accounting under duplicate and reordered delivery

mod common;

use common::Harness;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use wave_core::{
    plan_chunks, BatchOrchestration, BatchStatus, ResultKind, Store, UnitId, UnitResult, UserId,
};
use wave_kernel::{apply_completion, Ignored, Transition, UnitLaunch};
use wave_test_utils::{targets, ScriptedAgent, ScriptedReviewer};

proptest! {
    #[test]
    fn any_delivery_order_counts_each_unit_once(
        total in 1usize..15,
        limit in 1usize..6,
        duplicates in proptest::collection::vec(any::<u16>(), 0..30),
        successes in proptest::collection::vec(any::<bool>(), 15),
        order_seed in any::<u64>(),
    ) {
        let names: Vec<String> = (0..total).map(|i| format!("t{i}")).collect();
        let units: Vec<UnitId> = (0..total).map(|i| UnitId(format!("research-{i}"))).collect();
        let chunks = plan_chunks(&names, limit).unwrap();
        let mut batch = BatchOrchestration::new(UserId::new("u"), "task", names.clone(), limit);
        let mut rng = StdRng::seed_from_u64(order_seed);
        let mut signals = 0;

        for chunk in &chunks {
            batch.begin_chunk(chunk.index, chunk.targets.clone());
            let start = chunk.index * limit;
            let end = start + chunk.len();

            // Every unit of this wave once, plus replays of this and earlier waves
            let mut deliveries: Vec<usize> = (start..end).collect();
            deliveries.extend(duplicates.iter().map(|d| usize::from(*d) % end));
            deliveries.shuffle(&mut rng);

            for i in deliveries {
                let kind = if successes[i] { ResultKind::Success } else { ResultKind::Failed };
                let transition = apply_completion(&mut batch, &units[i], kind);

                prop_assert!(batch.accounted() <= batch.total());
                prop_assert!(batch.completed_in_current_chunk <= batch.current_chunk_size());
                if let Transition::Counted { chunk_complete, wave_signal, batch_complete } = transition {
                    prop_assert_eq!(wave_signal, chunk_complete && !batch_complete);
                    if wave_signal {
                        signals += 1;
                    }
                } else {
                    prop_assert_eq!(transition, Transition::Ignored(Ignored::AlreadyCounted));
                }
            }
            prop_assert_eq!(batch.completed_in_current_chunk, chunk.len());
        }

        prop_assert_eq!(signals, chunks.len() - 1);
        prop_assert_eq!(batch.wave_signals_fired as usize, chunks.len() - 1);
        prop_assert_eq!(batch.counted_units.len(), total);
        prop_assert!(batch.is_fully_accounted());
        prop_assert_eq!(
            batch.completed_count,
            successes[..total].iter().filter(|s| **s).count()
        );
    }
}

#[tokio::test]
async fn replayed_completions_after_finalization_change_nothing() {
    let h = Harness::new(ScriptedAgent::answering("done"), ScriptedReviewer::passing());
    let outcome = h.run(h.request(targets(4), 2)).await;
    let before = outcome.batch;
    assert_eq!(before.status, BatchStatus::Completed);

    for exec in h.store.executions_for_batch(before.id).await.unwrap() {
        let target = exec.target.clone().unwrap();
        let launch = UnitLaunch::new(&before, &exec, &target);
        let transition = h
            .engine
            .aggregator()
            .on_unit_complete(&launch.unit_id, ResultKind::Failed, &launch.event(UnitResult::failed("late"), None))
            .await
            .unwrap();
        assert_eq!(transition, Transition::Ignored(Ignored::BatchTerminal));
    }

    let after = h.batch(before.id).await;
    assert_eq!(after.completed_count, 4);
    assert_eq!(after.failed_count, 0);
    assert_eq!(after.revision, before.revision);
}

#[tokio::test]
async fn duplicate_delivery_mid_wave_is_absorbed() {
    let h = Harness::new(ScriptedAgent::answering("done"), ScriptedReviewer::passing());
    let mut batch = BatchOrchestration::new(UserId::new(common::OWNER), "task", targets(4), 2);
    batch.begin_chunk(0, targets(2));
    let batch = h.store.insert_batch(batch).await.unwrap();

    let aggregator = h.engine.aggregator().clone();
    let mut handles = Vec::new();
    for target in targets(2) {
        for _ in 0..5 {
            let aggregator = aggregator.clone();
            let unit = UnitId(format!("research-{target}"));
            let event = wave_core::CompletionEvent {
                unit_id: unit.clone(),
                result: UnitResult::success(),
                context: wave_core::CompletionContext {
                    batch_id: batch.id,
                    target: target.clone(),
                    task_execution_id: wave_core::ExecutionId::new(),
                    queue_slot_id: None,
                },
            };
            handles.push(tokio::spawn(async move {
                aggregator.on_unit_complete(&unit, ResultKind::Success, &event).await
            }));
        }
    }
    let mut counted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().counted() {
            counted += 1;
        }
    }

    assert_eq!(counted, 2);
    let stored = h.batch(batch.id).await;
    assert_eq!(stored.accounted(), 2);
    assert_eq!(stored.signalled_chunk, Some(0));
    assert_eq!(h.engine.signals().wave_signals(batch.id), 1);
}
