//! Wave Kernel - chunked batch orchestration
//!
//! Drives research batches through strictly ordered waves:
//! 1. **Orchestrator**: splits targets into waves and waits on each one
//! 2. **Dispatcher**: writes queued executions, then schedules their units
//! 3. **Units of work**: bounded agent loop inside a bounded review gate
//! 4. **Aggregator**: idempotent completion counting and the wave signal
//! 5. **Worker pool**: per-user execution slots
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use wave_kernel::prelude::*;
//!
//! let engine = Engine::new(collaborators, EngineConfig::default());
//! let request = BatchRequest::new(UserId::new("ana"), "Find the HQ city", targets)
//!     .with_concurrency_limit(5);
//! let outcome = engine.orchestrator().run(request).await?;
//! assert!(outcome.success);
//! ```

#![warn(unreachable_pub)]

pub mod aggregator;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod signal;
pub mod unit;

// Simulator
pub mod test_harness;

pub use aggregator::{apply_completion, Aggregator, CompletionSink, Ignored, Transition};
pub use dispatcher::{research_prompt, DispatchReport, Dispatcher, Scheduler};
pub use engine::{Collaborators, Engine};
pub use error::{
    DispatchError, OrchestratorError, PoolError, UnitError, CANCELLED_BY_CALLER,
};
pub use orchestrator::{BatchRequest, CancelReport, Orchestrator, RunOutcome};
pub use pool::{PoolStats, WorkerPool};
pub use signal::SignalBus;
pub use unit::{
    rubric_for_schema, run_agent_loop, terminal_result, Checkpoint, GateOutcome, LoopLimits,
    LoopOutcome, UnitLaunch, UnitMode, UnitRunner,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving batches
    pub use crate::{
        BatchRequest, CancelReport, Collaborators, Engine, Orchestrator, OrchestratorError,
        RunOutcome, WorkerPool,
    };
    pub use wave_core::prelude::*;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
