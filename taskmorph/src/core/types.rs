//! Shared deterministic types for the decision-and-dispatch core.
//!
//! These types define the contracts between the engine, decomposer,
//! dispatcher and coordinator. They carry no I/O handles and serialize to
//! stable JSON so they can be recorded in memory and fed to providers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Identifier of a task node. Root ids double as lineage ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Decomposed,
    Succeeded,
    Failed,
    CannotComplete,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Decomposed => "decomposed",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::CannotComplete => "cannot_complete",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::CannotComplete
        )
    }

    /// Status transitions are monotone: a task never moves backward.
    ///
    /// Re-asserting the current status is allowed so that callers can be
    /// idempotent.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            TaskStatus::Pending => next == TaskStatus::InProgress,
            TaskStatus::InProgress => next != TaskStatus::Pending,
            TaskStatus::Decomposed => next.is_terminal(),
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::CannotComplete => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating discipline for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Discover the action space a task needs before executing it.
    Morph,
    /// Execute against the registered action space, improving via memory.
    #[default]
    Learn,
}

/// Whether an action is a deterministic tool or another agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Tool,
    Delegate,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Tool => "tool",
            ActionKind::Delegate => "delegate",
        }
    }
}

/// Reference to an action by name and version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionRef {
    pub name: String,
    pub version: String,
}

impl ActionRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// The closed set of decisions the engine may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionKind {
    InvokeTool,
    InvokeDelegate,
    Decompose,
    CannotComplete,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::InvokeTool => "invoke-tool",
            DecisionKind::InvokeDelegate => "invoke-delegate",
            DecisionKind::Decompose => "decompose",
            DecisionKind::CannotComplete => "cannot-complete",
        }
    }
}

/// A sub-task proposed by a `decompose` decision.
///
/// Sub-tasks sharing a `group` are independent and may run concurrently.
/// Groups execute in ascending order; later groups see earlier outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    pub goal: String,
    #[serde(default)]
    pub group: u32,
    #[serde(default)]
    pub optional: bool,
}

/// A capability the engine would have used had it been available.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapabilityHint {
    pub kind: ActionKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl fmt::Display for CapabilityHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.name)
    }
}

/// Validated output of the decision engine for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub action: Option<ActionRef>,
    pub input: Value,
    /// A successful invocation finishes the task instead of returning to `Deciding`.
    pub completes_task: bool,
    pub sub_tasks: Vec<SubTaskSpec>,
    pub reason: String,
    pub wanted: Vec<CapabilityHint>,
}

impl Decision {
    pub fn cannot_complete(reason: impl Into<String>, wanted: Vec<CapabilityHint>) -> Self {
        Self {
            kind: DecisionKind::CannotComplete,
            action: None,
            input: Value::Null,
            completes_task: false,
            sub_tasks: Vec::new(),
            reason: reason.into(),
            wanted,
        }
    }

    /// Sub-task indices grouped by execution group, in ascending group order.
    pub fn execution_groups(&self) -> Vec<Vec<usize>> {
        let mut groups: Vec<u32> = self.sub_tasks.iter().map(|spec| spec.group).collect();
        groups.sort_unstable();
        groups.dedup();
        groups
            .into_iter()
            .map(|group| {
                self.sub_tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, spec)| spec.group == group)
                    .map(|(idx, _)| idx)
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Result of dispatching one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl Outcome {
    pub fn success(payload: Value) -> Self {
        Self {
            status: OutcomeStatus::Success,
            payload,
            error_kind: None,
        }
    }

    pub fn failure(kind: Option<ErrorKind>, payload: Value) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            payload,
            error_kind: kind,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Kind of memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryKind {
    AttemptResult,
    LearnedFact,
    FailureReason,
    ReasoningTrace,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::AttemptResult => "attempt-result",
            MemoryKind::LearnedFact => "learned-fact",
            MemoryKind::FailureReason => "failure-reason",
            MemoryKind::ReasoningTrace => "reasoning-trace",
        }
    }
}

/// Immutable fact or outcome tied to a task lineage.
///
/// `seq` is assigned by the store and totally orders records; it is the
/// record's logical timestamp. `recorded_at` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub seq: u64,
    pub lineage: TaskId,
    pub source: TaskId,
    pub kind: MemoryKind,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}
