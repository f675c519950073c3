//! Engine wiring
//!
//! Builds the kernel graph once: aggregator over the store and signal bus,
//! unit runner reporting into the aggregator, per-user worker pool running
//! the units, dispatcher feeding the pool, orchestrator on top.

use crate::aggregator::Aggregator;
use crate::dispatcher::Dispatcher;
use crate::orchestrator::Orchestrator;
use crate::pool::WorkerPool;
use crate::signal::SignalBus;
use crate::unit::UnitRunner;
use std::sync::Arc;
use wave_core::{Agent, Conversations, EngineConfig, Notifier, Reviewer, Store};

/// External collaborators the engine runs against
#[derive(Clone)]
pub struct Collaborators {
    /// Durable records
    pub store: Arc<dyn Store>,
    /// Model step
    pub agent: Arc<dyn Agent>,
    /// Quality reviewer
    pub reviewer: Arc<dyn Reviewer>,
    /// Conversation threads
    pub conversations: Arc<dyn Conversations>,
    /// Batch summary destination
    pub notifier: Arc<dyn Notifier>,
}

/// Fully wired kernel
pub struct Engine {
    store: Arc<dyn Store>,
    signals: Arc<SignalBus>,
    aggregator: Arc<Aggregator>,
    runner: Arc<UnitRunner>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    config: EngineConfig,
}

impl Engine {
    /// Wire the kernel over `collaborators`
    #[must_use]
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        let Collaborators {
            store,
            agent,
            reviewer,
            conversations,
            notifier,
        } = collaborators;

        let signals = Arc::new(SignalBus::new());
        let aggregator = Arc::new(Aggregator::new(store.clone(), signals.clone()));
        let runner = Arc::new(UnitRunner::new(
            store.clone(),
            agent,
            reviewer,
            conversations,
            aggregator.clone(),
            config.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(
            runner.clone(),
            config.worker_slots_per_user,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            pool.clone(),
            aggregator.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            dispatcher.clone(),
            signals.clone(),
            notifier,
            config.clone(),
        ));

        Self {
            store,
            signals,
            aggregator,
            runner,
            pool,
            dispatcher,
            orchestrator,
            config,
        }
    }

    /// Record store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Wake-up bus
    #[inline]
    #[must_use]
    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    /// Completion aggregator
    #[inline]
    #[must_use]
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Unit runner
    #[inline]
    #[must_use]
    pub fn runner(&self) -> &Arc<UnitRunner> {
        &self.runner
    }

    /// Worker pool
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Chunk dispatcher
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Orchestrator
    #[inline]
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Engine configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
