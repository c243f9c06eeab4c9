//! Per-task run context and cancellation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::action_space::ActionSpace;
use crate::core::types::{Mode, TaskId};
use crate::io::memory_store::MemoryStore;

#[derive(Debug, Default)]
struct CancelNode {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
}

/// Cancellation flag linked to its parent's.
///
/// A token reports cancelled when it or any ancestor was cancelled, so
/// cancelling a task reaches every descendant without tracking them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    node: Arc<CancelNode>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled with `self`, or on its own.
    pub fn child(&self) -> Self {
        Self {
            node: Arc::new(CancelNode {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.node.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut cursor = Some(self);
        while let Some(token) = cursor {
            if token.node.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            cursor = token.node.parent.as_ref();
        }
        false
    }
}

/// What one task sees while it decides and dispatches.
///
/// The action space is fixed for the task's whole cycle; the registry may
/// move on without affecting it.
#[derive(Clone)]
pub struct RunContext {
    pub agent: String,
    pub space: Arc<ActionSpace>,
    pub memory: Arc<dyn MemoryStore>,
    /// Learn mode shows the current learned facts to the provider; morph
    /// mode decides from the action space and attempt history alone.
    pub mode: Mode,
    pub lineage: TaskId,
    /// Exploratory run: absent actions become wanted capabilities.
    pub dry_run: bool,
    /// Whether the agent may decompose.
    pub recursive: bool,
    pub cancel: CancelToken,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("agent", &self.agent)
            .field("space_version", &self.space.version())
            .field("mode", &self.mode)
            .field("lineage", &self.lineage)
            .field("dry_run", &self.dry_run)
            .field("recursive", &self.recursive)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelling_a_parent_reaches_grandchildren() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();
        let sibling = root.child();

        child.cancel();
        assert!(grandchild.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());

        root.cancel();
        assert!(sibling.is_cancelled());
    }
}
