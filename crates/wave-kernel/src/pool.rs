//! Per-user worker pool
//!
//! Every batch owner gets a fixed number of execution slots. Units queue on
//! their owner's semaphore, so one user's large batch cannot starve another
//! user's units. The slot is released before the completion is reported.

use crate::dispatcher::Scheduler;
use crate::error::{DispatchError, PoolError};
use crate::unit::{UnitLaunch, UnitRunner};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use wave_core::{SlotId, UnitResult, UserId};

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Units waiting for a slot
    pub queued: usize,
    /// Units holding a slot
    pub active: usize,
    /// Highest `active` seen so far
    pub peak_active: usize,
    /// Units that finished, whatever their result
    pub finished: usize,
    /// Units that never got a slot
    pub rejected: usize,
}

/// Worker pool partitioned by batch owner
pub struct WorkerPool {
    runner: Arc<UnitRunner>,
    slots_per_user: usize,
    users: DashMap<UserId, Arc<Semaphore>>,
    stats: Arc<Mutex<PoolStats>>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create a pool giving each user `slots_per_user` concurrent units
    #[must_use]
    pub fn new(runner: Arc<UnitRunner>, slots_per_user: usize) -> Self {
        Self {
            runner,
            slots_per_user: slots_per_user.max(1),
            users: DashMap::new(),
            stats: Arc::new(Mutex::new(PoolStats::default())),
            closed: AtomicBool::new(false),
        }
    }

    /// Slots each user gets
    #[inline]
    #[must_use]
    pub fn slots_per_user(&self) -> usize {
        self.slots_per_user
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().clone()
    }

    /// Free slots for `user`
    #[must_use]
    pub fn available_slots(&self, user: &UserId) -> usize {
        self.users
            .get(user)
            .map_or(self.slots_per_user, |s| s.available_permits())
    }

    /// Stop accepting units and fail everything still queued
    ///
    /// Units already holding a slot run to completion.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.users.iter() {
            entry.value().close();
        }
        tracing::info!(users = self.users.len(), "worker pool shut down");
    }

    fn semaphore(&self, user: &UserId) -> Arc<Semaphore> {
        self.users
            .entry(user.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.slots_per_user)))
            .clone()
    }
}

#[async_trait]
impl Scheduler for WorkerPool {
    async fn schedule(&self, launch: UnitLaunch) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed.into());
        }
        let semaphore = self.semaphore(&launch.owner);
        let runner = self.runner.clone();
        let stats = self.stats.clone();
        stats.lock().queued += 1;

        tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let Ok(permit) = permit else {
                {
                    let mut s = stats.lock();
                    s.queued -= 1;
                    s.rejected += 1;
                }
                let error = PoolError::SlotsClosed(launch.owner.clone()).to_string();
                tracing::warn!(unit_id = %launch.unit_id, error = %error, "unit never got a slot");
                runner
                    .mark_failed(launch.context.task_execution_id, &error)
                    .await;
                runner
                    .report(launch.event(UnitResult::failed(error), None))
                    .await;
                return;
            };

            {
                let mut s = stats.lock();
                s.queued -= 1;
                s.active += 1;
                s.peak_active = s.peak_active.max(s.active);
            }
            let slot = SlotId::new();
            tracing::debug!(unit_id = %launch.unit_id, slot = %slot, "slot acquired");

            let event = runner.run(&launch, Some(slot)).await;
            drop(permit);
            {
                let mut s = stats.lock();
                s.active -= 1;
                s.finished += 1;
            }
            runner.report(event).await;
        });
        Ok(())
    }
}
