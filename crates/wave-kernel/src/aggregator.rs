//! Completion aggregator
//!
//! Every unit of work reports exactly one terminal result, possibly more than
//! once (re-dispatch after a restart, duplicate delivery). The aggregator
//! folds those reports into the batch counters through a compare-and-swap
//! keyed by the counted-unit set, and fires the wave-advance signal once per
//! wave.

use crate::signal::SignalBus;
use async_trait::async_trait;
use std::sync::Arc;
use wave_core::{
    modify_batch, BatchOrchestration, CompletionEvent, Modify, ResultKind, Store, StoreError,
    UnitId,
};

/// Why a report left the batch untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    /// Batch already completed, failed or cancelled
    BatchTerminal,
    /// Unit was counted before
    AlreadyCounted,
    /// Every target is already accounted for
    Overcount,
}

/// Effect of one completion report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Report dropped
    Ignored(Ignored),
    /// Report counted
    Counted {
        /// Current chunk is now fully accounted for
        chunk_complete: bool,
        /// Wave-advance signal must fire
        wave_signal: bool,
        /// Every target of the batch is now accounted for
        batch_complete: bool,
    },
}

impl Transition {
    /// Whether the report changed the counters
    #[inline]
    #[must_use]
    pub fn counted(&self) -> bool {
        matches!(self, Self::Counted { .. })
    }
}

/// Fold one report into the batch record
///
/// Pure; the caller persists the mutated record when the result is
/// [`Transition::Counted`]. The wave-advance decision is recorded durably in
/// `signalled_chunk` on the same write.
pub fn apply_completion(
    batch: &mut BatchOrchestration,
    unit: &UnitId,
    kind: ResultKind,
) -> Transition {
    if batch.status.is_terminal() {
        return Transition::Ignored(Ignored::BatchTerminal);
    }
    if batch.counted_units.contains(unit) {
        return Transition::Ignored(Ignored::AlreadyCounted);
    }
    if batch.is_fully_accounted() {
        return Transition::Ignored(Ignored::Overcount);
    }

    batch.completed_in_current_chunk += 1;
    match kind {
        ResultKind::Success => batch.completed_count += 1,
        ResultKind::Failed | ResultKind::Canceled => batch.failed_count += 1,
    }
    batch.counted_units.insert(unit.clone());

    let chunk_complete = batch.completed_in_current_chunk >= batch.current_chunk_size();
    let batch_complete = batch.is_fully_accounted();
    let mut wave_signal = false;

    if chunk_complete && !batch_complete {
        if let Some(index) = batch.current_chunk.as_ref().map(|c| c.index) {
            if !batch.wave_signalled(index) {
                batch.signalled_chunk = Some(index);
                batch.wave_signals_fired += 1;
                wave_signal = true;
            }
        }
    }

    Transition::Counted {
        chunk_complete,
        wave_signal,
        batch_complete,
    }
}

/// Receiver of unit completion reports
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Handle one completion report
    async fn report(&self, event: CompletionEvent) -> Result<Transition, StoreError>;
}

/// Store-backed aggregator
pub struct Aggregator {
    store: Arc<dyn Store>,
    signals: Arc<SignalBus>,
}

impl Aggregator {
    /// Create an aggregator
    #[must_use]
    pub fn new(store: Arc<dyn Store>, signals: Arc<SignalBus>) -> Self {
        Self { store, signals }
    }

    /// Count a unit's terminal result
    ///
    /// # Errors
    /// Store failures other than a finalized batch, which is a no-op.
    pub async fn on_unit_complete(
        &self,
        unit: &UnitId,
        kind: ResultKind,
        event: &CompletionEvent,
    ) -> Result<Transition, StoreError> {
        let batch_id = event.context.batch_id;
        let outcome = modify_batch(self.store.as_ref(), batch_id, |batch| {
            match apply_completion(batch, unit, kind) {
                t @ Transition::Ignored(_) => Modify::Skip(t),
                t => Modify::Write(t),
            }
        })
        .await;

        let (batch, transition) = match outcome {
            Ok(done) => done,
            Err(StoreError::BatchFinalized(_)) => {
                return Ok(Transition::Ignored(Ignored::BatchTerminal))
            }
            Err(e) => return Err(e),
        };

        match transition {
            Transition::Ignored(Ignored::Overcount) => {
                tracing::warn!(
                    batch_id = %batch_id,
                    unit_id = %unit,
                    total = batch.total(),
                    "completion ignored: batch already fully accounted for"
                );
            }
            Transition::Ignored(reason) => {
                tracing::debug!(batch_id = %batch_id, unit_id = %unit, ?reason, "completion ignored");
            }
            Transition::Counted {
                wave_signal,
                batch_complete,
                ..
            } => {
                tracing::info!(
                    batch_id = %batch_id,
                    unit_id = %unit,
                    target = %event.context.target,
                    result = %kind,
                    completed = batch.completed_count,
                    failed = batch.failed_count,
                    in_chunk = batch.completed_in_current_chunk,
                    "unit counted"
                );
                if wave_signal {
                    self.signals.signal_wave(batch_id);
                } else if batch_complete {
                    // Last wave: the orchestrator finalizes on its own path
                    self.signals.wake(batch_id);
                }
            }
        }
        Ok(transition)
    }
}

#[async_trait]
impl CompletionSink for Aggregator {
    async fn report(&self, event: CompletionEvent) -> Result<Transition, StoreError> {
        self.on_unit_complete(&event.unit_id, event.result.kind, &event)
            .await
    }
}
