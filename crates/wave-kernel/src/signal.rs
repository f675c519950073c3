//! Orchestrator wake-ups
//!
//! The durable half of a wave wait is the batch record (`signalled_chunk`,
//! counters, status). This bus is the in-process half: it wakes the
//! orchestrator so it re-reads the record instead of polling. A wake-up that
//! arrives before anyone waits is kept as a permit, so it is never lost.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use wave_core::BatchId;

/// Per-batch wake-up channels
#[derive(Debug, Default)]
pub struct SignalBus {
    channels: DashMap<BatchId, Arc<Notify>>,
    wave_signals: DashMap<BatchId, u32>,
}

impl SignalBus {
    /// Create an empty bus
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel the orchestrator of `batch` waits on
    #[must_use]
    pub fn channel(&self, batch: BatchId) -> Arc<Notify> {
        self.channels.entry(batch).or_default().clone()
    }

    /// Fire the wave-advance signal for `batch`
    pub fn signal_wave(&self, batch: BatchId) {
        *self.wave_signals.entry(batch).or_insert(0) += 1;
        tracing::debug!(batch_id = %batch, "wave-advance signal");
        self.channel(batch).notify_one();
    }

    /// Wake the orchestrator without advancing a wave (final accounting,
    /// cancellation)
    pub fn wake(&self, batch: BatchId) {
        self.channel(batch).notify_one();
    }

    /// Wave-advance signals delivered on this bus for `batch`
    #[must_use]
    pub fn wave_signals(&self, batch: BatchId) -> u32 {
        self.wave_signals.get(&batch).map_or(0, |n| *n)
    }

    /// Drop the channel and its signal count once the batch is finalized
    ///
    /// Returns the wave-advance signals this bus delivered for `batch`.
    pub fn forget(&self, batch: BatchId) -> u32 {
        self.channels.remove(&batch);
        self.wave_signals.remove(&batch).map_or(0, |(_, n)| n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_before_wait_is_not_lost() {
        let bus = SignalBus::new();
        let batch = BatchId::new();
        bus.signal_wave(batch);

        let woke = tokio::time::timeout(Duration::from_secs(1), bus.channel(batch).notified()).await;
        assert!(woke.is_ok());
        assert_eq!(bus.wave_signals(batch), 1);
    }

    #[tokio::test]
    async fn wake_does_not_count_as_wave_signal() {
        let bus = SignalBus::new();
        let batch = BatchId::new();
        bus.wake(batch);
        assert_eq!(bus.wave_signals(batch), 0);
    }

    #[test]
    fn forget_drops_channel_and_count() {
        let bus = SignalBus::new();
        let batch = BatchId::new();
        bus.signal_wave(batch);
        bus.signal_wave(batch);

        assert_eq!(bus.forget(batch), 2);
        assert_eq!(bus.wave_signals(batch), 0);
        assert!(bus.channels.is_empty());
        assert!(bus.wave_signals.is_empty());
        assert_eq!(bus.forget(batch), 0);
    }

    #[tokio::test]
    async fn batches_are_isolated() {
        let bus = SignalBus::new();
        let a = BatchId::new();
        let b = BatchId::new();
        bus.signal_wave(a);

        let woke = tokio::time::timeout(Duration::from_millis(50), bus.channel(b).notified()).await;
        assert!(woke.is_err());
    }
}
