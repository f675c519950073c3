//! Shared wiring for kernel integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use wave_core::{
    BatchId, BatchOrchestration, EngineConfig, MemoryConversations, MemoryStore, Store,
    TaskExecution, UserId,
};
use wave_kernel::{BatchRequest, Collaborators, Engine, RunOutcome};
use wave_test_utils::{RecordingNotifier, ScriptedAgent, ScriptedReviewer};

pub const OWNER: &str = "analyst";

pub fn config() -> EngineConfig {
    EngineConfig::new().with_wave_poll_interval(Duration::from_millis(20))
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<dyn Store>,
    pub agent: Arc<ScriptedAgent>,
    pub reviewer: Arc<ScriptedReviewer>,
    pub conversations: Arc<MemoryConversations>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(agent: ScriptedAgent, reviewer: ScriptedReviewer) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), agent, reviewer, config())
    }

    pub fn with_config(agent: ScriptedAgent, reviewer: ScriptedReviewer, config: EngineConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), agent, reviewer, config)
    }

    pub fn with_store(
        store: Arc<dyn Store>,
        agent: ScriptedAgent,
        reviewer: ScriptedReviewer,
        config: EngineConfig,
    ) -> Self {
        Self::with_backends(store, Arc::new(MemoryConversations::new()), agent, reviewer, config)
    }

    /// Harness over existing durable backends, as a restarted process sees them
    pub fn with_backends(
        store: Arc<dyn Store>,
        conversations: Arc<MemoryConversations>,
        agent: ScriptedAgent,
        reviewer: ScriptedReviewer,
        config: EngineConfig,
    ) -> Self {
        let agent = Arc::new(agent);
        let reviewer = Arc::new(reviewer);
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Engine::new(
            Collaborators {
                store: store.clone(),
                agent: agent.clone(),
                reviewer: reviewer.clone(),
                conversations: conversations.clone(),
                notifier: notifier.clone(),
            },
            config,
        );
        Self {
            engine,
            store,
            agent,
            reviewer,
            conversations,
            notifier,
        }
    }

    pub fn request(&self, targets: Vec<String>, limit: usize) -> BatchRequest {
        BatchRequest::new(UserId::new(OWNER), "Find the headquarters city", targets)
            .with_concurrency_limit(limit)
    }

    pub async fn run(&self, request: BatchRequest) -> RunOutcome {
        tokio::time::timeout(Duration::from_secs(10), self.engine.orchestrator().run(request))
            .await
            .expect("batch did not finish in time")
            .expect("orchestrator failed")
    }

    pub async fn batch(&self, id: BatchId) -> BatchOrchestration {
        self.store.batch(id).await.unwrap()
    }

    pub async fn execution(&self, batch: BatchId, target: &str) -> TaskExecution {
        self.store
            .find_execution(batch, target)
            .await
            .unwrap()
            .expect("execution exists")
    }

    /// Poll until `check` holds on the batch record
    pub async fn until(&self, id: BatchId, check: impl Fn(&BatchOrchestration) -> bool) -> BatchOrchestration {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let batch = self.batch(id).await;
                if check(&batch) {
                    return batch;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    }
}
