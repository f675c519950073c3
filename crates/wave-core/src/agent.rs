//! Agent step collaborator
//!
//! One bounded step of the language-model agent against a conversation
//! thread. The unit of work drives the loop; the agent only reports why the
//! step stopped and what text it produced.

use crate::error::AgentError;
use crate::review::FieldValues;
use crate::types::{ExecutionId, MessageId, RowId, ThreadId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Tool name for writing structured values into the result row
pub const SAVE_VALUES_TOOL: &str = "save_values";
/// Tool name for spawning a delegated sub-thread
pub const DELEGATE_TOOL: &str = "delegate";
/// Tool name for updating the scratchpad
pub const SCRATCHPAD_TOOL: &str = "update_scratchpad";

/// Why a step stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// Agent issued tool calls and must be stepped again
    ToolCalls,
    /// Agent finished its turn
    Stop,
    /// Output token budget hit
    Length,
    /// Provider filtered the output
    ContentFilter,
    /// Provider-specific reason
    Other(String),
}

impl FinishReason {
    /// Only tool calls keep the loop going
    #[inline]
    #[must_use]
    pub fn wants_another_step(&self) -> bool {
        matches!(self, Self::ToolCalls)
    }
}

/// Which thread message the step should answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptRef {
    /// The original research prompt
    Original(MessageId),
    /// Review feedback for the given attempt
    Feedback {
        /// Feedback message
        message: MessageId,
        /// Review attempt that produced it
        attempt: u32,
    },
}

impl PromptRef {
    /// Referenced message
    #[inline]
    #[must_use]
    pub fn message(&self) -> MessageId {
        match self {
            Self::Original(m) | Self::Feedback { message: m, .. } => *m,
        }
    }
}

/// Tool exposed to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name
    pub name: String,
    /// What the tool does
    pub description: String,
}

impl ToolSpec {
    /// Create a tool spec
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Side effects an agent's tool calls resolve to
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// Write captured values into the result row, returning cells written
    async fn save_values(&self, values: FieldValues) -> Result<usize, AgentError>;

    /// Replace the scratchpad and optionally the progress label
    async fn update_scratchpad(&self, text: &str, progress: Option<&str>)
        -> Result<(), AgentError>;

    /// Hand a sub-task to a child thread of `parent` (the unit's own thread
    /// when `None`)
    async fn delegate(
        &self,
        parent: Option<ThreadId>,
        title: &str,
        brief: &str,
    ) -> Result<ThreadId, AgentError>;
}

/// Handles the agent may act through while stepping
#[derive(Clone)]
pub struct StepScope {
    /// Execution being researched
    pub execution_id: ExecutionId,
    /// Target name
    pub target: String,
    /// Result row receiving saved values, in dataset mode
    pub row_id: Option<RowId>,
    /// Tool side effects
    pub tools: Arc<dyn ToolHost>,
}

impl fmt::Debug for StepScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepScope")
            .field("execution_id", &self.execution_id)
            .field("target", &self.target)
            .field("row_id", &self.row_id)
            .finish_non_exhaustive()
    }
}

/// Input of one step
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Thread the agent runs against
    pub thread_id: ThreadId,
    /// System prompt
    pub system_prompt: String,
    /// Message to answer
    pub prompt: PromptRef,
    /// Tools available this step
    pub tools: Vec<ToolSpec>,
    /// Action handles
    pub scope: StepScope,
}

/// Output of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Why the step stopped
    pub finish_reason: FinishReason,
    /// Text emitted during the step
    pub text: String,
}

impl StepOutcome {
    /// Step that issued tool calls
    #[inline]
    #[must_use]
    pub fn tool_calls(text: impl Into<String>) -> Self {
        Self {
            finish_reason: FinishReason::ToolCalls,
            text: text.into(),
        }
    }

    /// Step that finished the turn
    #[inline]
    #[must_use]
    pub fn stop(text: impl Into<String>) -> Self {
        Self {
            finish_reason: FinishReason::Stop,
            text: text.into(),
        }
    }
}

/// Bounded single-step language-model agent
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run one step
    async fn step(&self, request: StepRequest) -> Result<StepOutcome, AgentError>;
}
