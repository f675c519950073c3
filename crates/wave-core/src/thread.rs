//! Conversation threads
//!
//! The agent runs against a thread; the unit of work appends the original
//! prompt and any review feedback to it. Delegated sub-tasks get child
//! threads that point back at their parent.

use crate::error::ThreadError;
use crate::types::{MessageId, ThreadId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human or orchestrator input
    User,
    /// Agent output
    Assistant,
    /// Engine annotations (review feedback, summaries)
    System,
}

/// One thread message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier
    pub id: MessageId,
    /// Author
    pub role: Role,
    /// Body
    pub content: String,
    /// Append time
    pub at: DateTime<Utc>,
}

/// Thread metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    /// Thread identifier
    pub id: ThreadId,
    /// Title
    pub title: String,
    /// Parent thread for delegated sub-tasks
    pub parent: Option<ThreadId>,
}

/// Conversation thread collaborator
#[async_trait]
pub trait Conversations: Send + Sync {
    /// Create a thread, optionally as a child of `parent`
    async fn create_thread(
        &self,
        title: &str,
        parent: Option<ThreadId>,
    ) -> Result<ThreadId, ThreadError>;

    /// Append a message
    async fn append(
        &self,
        thread: ThreadId,
        role: Role,
        content: &str,
    ) -> Result<MessageId, ThreadError>;

    /// All messages in append order
    async fn messages(&self, thread: ThreadId) -> Result<Vec<Message>, ThreadError>;

    /// Thread metadata
    async fn info(&self, thread: ThreadId) -> Result<ThreadInfo, ThreadError>;
}

#[derive(Debug)]
struct ThreadRecord {
    info: ThreadInfo,
    messages: Vec<Message>,
}

/// In-process thread backend
#[derive(Debug, Default)]
pub struct MemoryConversations {
    threads: DashMap<ThreadId, ThreadRecord>,
}

impl MemoryConversations {
    /// Create an empty backend
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads
    #[inline]
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

#[async_trait]
impl Conversations for MemoryConversations {
    async fn create_thread(
        &self,
        title: &str,
        parent: Option<ThreadId>,
    ) -> Result<ThreadId, ThreadError> {
        if let Some(parent) = parent {
            if !self.threads.contains_key(&parent) {
                return Err(ThreadError::NotFound(parent));
            }
        }
        let id = ThreadId::new();
        self.threads.insert(
            id,
            ThreadRecord {
                info: ThreadInfo {
                    id,
                    title: title.to_string(),
                    parent,
                },
                messages: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn append(
        &self,
        thread: ThreadId,
        role: Role,
        content: &str,
    ) -> Result<MessageId, ThreadError> {
        let mut record = self
            .threads
            .get_mut(&thread)
            .ok_or(ThreadError::NotFound(thread))?;
        let id = MessageId::new();
        record.messages.push(Message {
            id,
            role,
            content: content.to_string(),
            at: Utc::now(),
        });
        Ok(id)
    }

    async fn messages(&self, thread: ThreadId) -> Result<Vec<Message>, ThreadError> {
        self.threads
            .get(&thread)
            .map(|r| r.messages.clone())
            .ok_or(ThreadError::NotFound(thread))
    }

    async fn info(&self, thread: ThreadId) -> Result<ThreadInfo, ThreadError> {
        self.threads
            .get(&thread)
            .map(|r| r.info.clone())
            .ok_or(ThreadError::NotFound(thread))
    }
}
