//! Bounded delegation tree
//!
//! A coordinating agent may hand sub-tasks to child threads. Every child
//! records its parent, and the tree enforces a maximum depth and a maximum
//! number of sub-tasks so it stays finite and auditable.

use crate::error::DelegationError;
use crate::thread::{Conversations, Role};
use crate::types::ThreadId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Delegation limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationPolicy {
    /// Deepest level below the root (root is depth 0)
    pub max_depth: usize,
    /// Sub-tasks allowed across the whole tree
    pub max_subtasks: usize,
}

impl Default for DelegationPolicy {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_subtasks: 8,
        }
    }
}

/// One thread in the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationNode {
    /// Thread of this node
    pub thread: ThreadId,
    /// Parent task thread, `None` for the root
    pub parent: Option<ThreadId>,
    /// Distance from the root
    pub depth: usize,
    /// Sub-task title
    pub title: String,
}

#[derive(Debug)]
struct TreeState {
    nodes: Vec<DelegationNode>,
    // Slots claimed by delegations whose child thread is still being created
    reserved: usize,
}

/// Delegation tree rooted at a unit's thread
pub struct DelegationTree {
    policy: DelegationPolicy,
    conversations: Arc<dyn Conversations>,
    state: Mutex<TreeState>,
}

impl DelegationTree {
    /// Create a tree rooted at `root`
    #[must_use]
    pub fn new(
        root: ThreadId,
        policy: DelegationPolicy,
        conversations: Arc<dyn Conversations>,
    ) -> Self {
        Self {
            policy,
            conversations,
            state: Mutex::new(TreeState {
                nodes: vec![DelegationNode {
                    thread: root,
                    parent: None,
                    depth: 0,
                    title: "root".to_string(),
                }],
                reserved: 0,
            }),
        }
    }

    /// Spawn a sub-task thread under `parent` and post the brief to it
    ///
    /// # Errors
    /// - `DelegationError::UnknownParent` if `parent` is not in the tree
    /// - `DelegationError::DepthExceeded` past `max_depth`
    /// - `DelegationError::SubtaskLimit` past `max_subtasks`
    /// - `DelegationError::Thread` if the thread backend fails
    pub async fn delegate(
        &self,
        parent: ThreadId,
        title: &str,
        brief: &str,
    ) -> Result<ThreadId, DelegationError> {
        let depth = {
            let mut state = self.state.lock();
            let parent_depth = state
                .nodes
                .iter()
                .find(|n| n.thread == parent)
                .map(|n| n.depth)
                .ok_or(DelegationError::UnknownParent(parent))?;

            let depth = parent_depth + 1;
            if depth > self.policy.max_depth {
                return Err(DelegationError::DepthExceeded(self.policy.max_depth));
            }
            let used = state.nodes.len() - 1 + state.reserved;
            if used >= self.policy.max_subtasks {
                return Err(DelegationError::SubtaskLimit(self.policy.max_subtasks));
            }
            state.reserved += 1;
            depth
        };

        let created = self.create_child(parent, title, brief).await;

        let mut state = self.state.lock();
        state.reserved -= 1;
        let thread = created?;
        state.nodes.push(DelegationNode {
            thread,
            parent: Some(parent),
            depth,
            title: title.to_string(),
        });
        tracing::debug!(%parent, child = %thread, depth, "delegated sub-task");
        Ok(thread)
    }

    async fn create_child(
        &self,
        parent: ThreadId,
        title: &str,
        brief: &str,
    ) -> Result<ThreadId, DelegationError> {
        let thread = self
            .conversations
            .create_thread(title, Some(parent))
            .await
            .map_err(|e| DelegationError::Thread(e.to_string()))?;
        self.conversations
            .append(thread, Role::User, brief)
            .await
            .map_err(|e| DelegationError::Thread(e.to_string()))?;
        Ok(thread)
    }

    /// Root thread
    #[must_use]
    pub fn root(&self) -> ThreadId {
        self.state.lock().nodes[0].thread
    }

    /// Delegated nodes, excluding the root
    #[must_use]
    pub fn subtasks(&self) -> Vec<DelegationNode> {
        self.state.lock().nodes[1..].to_vec()
    }

    /// Depth of a thread in the tree
    #[must_use]
    pub fn depth_of(&self, thread: ThreadId) -> Option<usize> {
        self.state
            .lock()
            .nodes
            .iter()
            .find(|n| n.thread == thread)
            .map(|n| n.depth)
    }

    /// Active limits
    #[inline]
    #[must_use]
    pub fn policy(&self) -> DelegationPolicy {
        self.policy
    }
}

impl fmt::Debug for DelegationTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DelegationTree")
            .field("policy", &self.policy)
            .field("nodes", &state.nodes)
            .finish_non_exhaustive()
    }
}
