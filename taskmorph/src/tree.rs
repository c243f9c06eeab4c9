//! The task tree owned by one run.
//!
//! Tasks live in a flat map keyed by id with explicit parent/child links, so
//! sibling tasks running on different threads can update their own nodes
//! through a shared lock without holding references into each other.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::decomposer::PathEntry;
use crate::core::state_machine::RunState;
use crate::core::types::{TaskId, TaskStatus};
use crate::error::ErrorKind;

/// Why a task exists.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum TaskOrigin {
    Root,
    /// Produced by a `decompose` decision.
    Subtask { group: u32, optional: bool },
    /// Spawned by an `invoke-delegate` dispatch attempt.
    Delegation { action: String, attempt: u32 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub lineage: TaskId,
    pub agent: String,
    pub goal: String,
    pub input: Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Insertion order within the run; strictly increases from parent to child.
    pub seq: u64,
    pub origin: TaskOrigin,
    pub auto_morph: bool,
    pub states: Vec<RunState>,
    pub output: Option<Value>,
    pub error: Option<ErrorKind>,
    pub children: Vec<TaskId>,
    /// Rounds of children this task has spawned (decompositions and delegations).
    pub waves: u32,
    /// The parent's round this task was spawned in.
    pub wave: u32,
}

impl Task {
    /// Failure of this task is acceptable to its parent.
    pub fn is_optional(&self) -> bool {
        matches!(self.origin, TaskOrigin::Subtask { optional: true, .. })
    }

    pub fn state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Created)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskTree {
    root: TaskId,
    next_seq: u64,
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskTree {
    /// Start a tree with a fresh lineage id.
    pub fn new_root(agent: &str, goal: &str, input: Value, auto_morph: bool) -> Self {
        let id = TaskId(Uuid::new_v4().to_string());
        let root = Task {
            id: id.clone(),
            parent: None,
            lineage: id.clone(),
            agent: agent.to_string(),
            goal: goal.to_string(),
            input,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            seq: 0,
            origin: TaskOrigin::Root,
            auto_morph,
            states: vec![RunState::Created],
            output: None,
            error: None,
            children: Vec::new(),
            waves: 0,
            wave: 0,
        };
        let mut tasks = BTreeMap::new();
        tasks.insert(id.clone(), root);
        Self {
            root: id,
            next_seq: 1,
            tasks,
        }
    }

    pub fn root_id(&self) -> &TaskId {
        &self.root
    }

    pub fn root(&self) -> Result<&Task> {
        self.get(&self.root)
    }

    pub fn get(&self, id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| anyhow!("unknown task {id}"))
    }

    fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown task {id}"))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert a child owned by `parent`. Ids are `<parent>.<n>`.
    pub fn add_child(
        &mut self,
        parent: &TaskId,
        agent: &str,
        goal: &str,
        input: Value,
        origin: TaskOrigin,
    ) -> Result<TaskId> {
        let seq = self.next_seq;
        let parent_task = self.get_mut(parent)?;
        if parent_task.status.is_terminal() {
            bail!("cannot add a child to {} task {parent}", parent_task.status);
        }
        let id = TaskId(format!("{parent}.{}", parent_task.children.len() + 1));
        parent_task.children.push(id.clone());
        let lineage = parent_task.lineage.clone();
        let auto_morph = parent_task.auto_morph;
        let wave = parent_task.waves;

        self.tasks.insert(
            id.clone(),
            Task {
                id: id.clone(),
                parent: Some(parent.clone()),
                lineage,
                agent: agent.to_string(),
                goal: goal.to_string(),
                input,
                status: TaskStatus::Pending,
                created_at: Utc::now(),
                seq,
                origin,
                auto_morph,
                states: vec![RunState::Created],
                output: None,
                error: None,
                children: Vec::new(),
                waves: 0,
                wave,
            },
        );
        self.next_seq += 1;
        Ok(id)
    }

    /// Move a task's status forward; backward moves are rejected.
    pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) -> Result<()> {
        let task = self.get_mut(id)?;
        if !task.status.can_advance_to(status) {
            bail!("task {id}: status cannot move from {} to {status}", task.status);
        }
        task.status = status;
        Ok(())
    }

    /// Record a coordinator state transition.
    pub fn push_state(&mut self, id: &TaskId, state: RunState) -> Result<()> {
        let task = self.get_mut(id)?;
        let current = task.state();
        if !current.can_transition_to(state) {
            bail!("task {id}: illegal transition {current} -> {state}");
        }
        task.states.push(state);
        Ok(())
    }

    /// Open a new round of children under `id`.
    pub fn begin_wave(&mut self, id: &TaskId) -> Result<u32> {
        let task = self.get_mut(id)?;
        task.waves += 1;
        Ok(task.waves)
    }

    pub fn set_input(&mut self, id: &TaskId, input: Value) -> Result<()> {
        self.get_mut(id)?.input = input;
        Ok(())
    }

    pub fn set_output(&mut self, id: &TaskId, output: Value) -> Result<()> {
        self.get_mut(id)?.output = Some(output);
        Ok(())
    }

    pub fn set_error(&mut self, id: &TaskId, kind: Option<ErrorKind>) -> Result<()> {
        self.get_mut(id)?.error = kind;
        Ok(())
    }

    /// Agent and goal of every task from the root down to `id`, inclusive.
    pub fn path(&self, id: &TaskId) -> Result<Vec<PathEntry>> {
        let mut entries = Vec::new();
        let mut cursor = Some(id.clone());
        while let Some(current) = cursor {
            let task = self.get(&current)?;
            entries.push(PathEntry {
                agent: task.agent.clone(),
                goal: task.goal.clone(),
            });
            cursor = task.parent.clone();
        }
        entries.reverse();
        Ok(entries)
    }

    pub fn depth(&self, id: &TaskId) -> Result<usize> {
        Ok(self.path(id)?.len() - 1)
    }

    /// `id` followed by all of its descendants, depth first.
    pub fn subtree(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        let mut out = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            let task = self.get(&current)?;
            stack.extend(task.children.iter().rev().cloned());
            out.push(current);
        }
        Ok(out)
    }
}
