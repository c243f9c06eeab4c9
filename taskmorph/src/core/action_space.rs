//! Action space snapshots and the diffs between them.
//!
//! An [`ActionSpace`] is immutable once built. The registry hands out
//! `Arc<ActionSpace>` snapshots; mutation happens by applying an
//! [`ActionSpaceDiff`] to produce a new space with a higher version.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{ActionKind, ActionRef};

/// A deterministic external capability.
///
/// Implementations must be safe to call from several task threads at once.
pub trait Tool: Send + Sync {
    fn invoke(&self, input: &Value) -> Result<Value>;
}

/// Serializable description of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: ActionSpecKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActionSpecKind {
    Tool {
        input_schema: Value,
        output_schema: Value,
        #[serde(default)]
        requires_approval: bool,
    },
    Delegate {
        /// Agent definition that receives the delegated task.
        agent: String,
    },
}

impl ActionSpec {
    pub fn reference(&self) -> ActionRef {
        ActionRef::new(&self.name, &self.version)
    }

    pub fn kind(&self) -> ActionKind {
        match self.kind {
            ActionSpecKind::Tool { .. } => ActionKind::Tool,
            ActionSpecKind::Delegate { .. } => ActionKind::Delegate,
        }
    }
}

/// An action together with its invocation handler (tools only).
#[derive(Clone)]
pub struct Action {
    pub spec: ActionSpec,
    pub handler: Option<Arc<dyn Tool>>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("spec", &self.spec)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Action {
    pub fn tool(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        output_schema: Value,
        handler: Arc<dyn Tool>,
    ) -> Self {
        Self {
            spec: ActionSpec {
                name: name.into(),
                version: version.into(),
                description: description.into(),
                kind: ActionSpecKind::Tool {
                    input_schema,
                    output_schema,
                    requires_approval: false,
                },
            },
            handler: Some(handler),
        }
    }

    pub fn delegate(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            spec: ActionSpec {
                name: name.into(),
                version: version.into(),
                description: description.into(),
                kind: ActionSpecKind::Delegate {
                    agent: agent.into(),
                },
            },
            handler: None,
        }
    }

    /// Mark a tool as requiring approval before each invocation.
    pub fn requiring_approval(mut self) -> Self {
        if let ActionSpecKind::Tool {
            requires_approval, ..
        } = &mut self.spec.kind
        {
            *requires_approval = true;
        }
        self
    }

    pub fn reference(&self) -> ActionRef {
        self.spec.reference()
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Immutable set of actions visible to an agent at decision time.
///
/// Actions are keyed by name; at most one version of a name is visible.
#[derive(Debug, Clone, Default)]
pub struct ActionSpace {
    version: u64,
    actions: BTreeMap<String, Action>,
}

impl ActionSpace {
    pub fn new(version: u64, actions: impl IntoIterator<Item = Action>) -> Self {
        let actions = actions
            .into_iter()
            .map(|action| (action.spec.name.clone(), action))
            .collect();
        Self { version, actions }
    }

    /// An exploratory space with nothing in it.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    /// True if the exact `name@version` is present.
    pub fn contains(&self, reference: &ActionRef) -> bool {
        self.actions
            .get(&reference.name)
            .is_some_and(|action| action.spec.version == reference.version)
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.values()
    }

    pub fn references(&self) -> Vec<ActionRef> {
        self.actions.values().map(Action::reference).collect()
    }

    /// Diff that turns `self` into `target`.
    ///
    /// Actions only in `target` are additions; actions only in `self` are
    /// removals. A version change counts as a removal plus an addition.
    pub fn diff(&self, target: &ActionSpace) -> ActionSpaceDiff {
        let mut diff = ActionSpaceDiff::default();
        for action in target.actions() {
            if !self.contains(&action.reference()) {
                diff.added.push(action.clone());
            }
        }
        for action in self.actions() {
            if !target.contains(&action.reference()) {
                diff.removed.push(action.reference());
            }
        }
        diff
    }

    /// Apply `diff`, producing a new space with the next version.
    pub fn apply(&self, diff: &ActionSpaceDiff) -> ActionSpace {
        let mut actions = self.actions.clone();
        for removed in &diff.removed {
            if self.contains(removed) {
                actions.remove(&removed.name);
            }
        }
        for added in &diff.added {
            actions.insert(added.spec.name.clone(), added.clone());
        }
        ActionSpace {
            version: self.version + 1,
            actions,
        }
    }
}

/// Additions and removals between two action spaces.
#[derive(Debug, Clone, Default)]
pub struct ActionSpaceDiff {
    pub added: Vec<Action>,
    pub removed: Vec<ActionRef>,
}

impl ActionSpaceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    pub fn added_refs(&self) -> Vec<ActionRef> {
        self.added.iter().map(Action::reference).collect()
    }
}
