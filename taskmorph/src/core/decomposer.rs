//! Monotonic task decomposition and delegation cycle checks.
//!
//! Validation is all-or-nothing: a plan is returned only when every proposed
//! sub-task passes, so the coordinator never inserts a partial set of
//! children.

use std::collections::BTreeSet;

use crate::core::scope::{is_superset, normalize};
use crate::core::types::{SubTaskSpec, TaskId};
use crate::error::CoreError;

/// One unresolved task on the path from the root to the task being expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub agent: String,
    pub goal: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecomposeLimits {
    /// Deepest level a child may occupy (the root is level 0).
    pub max_depth: usize,
    pub max_children: usize,
}

/// Validated sub-tasks, grouped in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub groups: Vec<Vec<SubTaskSpec>>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(Vec::is_empty)
    }
}

/// Validate `specs` as children of the last entry in `path`.
///
/// `path` runs from the root to the task being decomposed, inclusive.
pub fn decompose(
    task: &TaskId,
    path: &[PathEntry],
    specs: &[SubTaskSpec],
    limits: &DecomposeLimits,
) -> Result<Plan, CoreError> {
    let violation = |detail: String| CoreError::DecompositionInvariantViolation {
        task: task.to_string(),
        detail,
    };

    let Some(parent) = path.last() else {
        return Err(violation("task has no path".to_string()));
    };
    if specs.is_empty() {
        return Err(violation("decomposition produced no sub-tasks".to_string()));
    }
    if specs.len() > limits.max_children {
        return Err(violation(format!(
            "{} sub-tasks exceed the limit of {}",
            specs.len(),
            limits.max_children
        )));
    }
    if path.len() > limits.max_depth {
        return Err(violation(format!(
            "children would sit at depth {} beyond the limit of {}",
            path.len(),
            limits.max_depth
        )));
    }

    let parent_goal = normalize(&parent.goal);
    let ancestors: BTreeSet<String> = path.iter().map(|entry| normalize(&entry.goal)).collect();
    let mut seen = BTreeSet::new();
    let mut errors = Vec::new();

    for (idx, spec) in specs.iter().enumerate() {
        let goal = normalize(&spec.goal);
        if goal.is_empty() {
            errors.push(format!("sub-task {idx}: goal is empty"));
            continue;
        }
        if goal == parent_goal {
            errors.push(format!("sub-task {idx}: goal is identical to its parent"));
            continue;
        }
        if is_superset(&spec.goal, &parent.goal) {
            errors.push(format!(
                "sub-task {idx}: '{}' covers the whole parent goal",
                spec.goal
            ));
            continue;
        }
        if ancestors.contains(&goal) {
            errors.push(format!(
                "sub-task {idx}: '{}' repeats an unresolved ancestor",
                spec.goal
            ));
            continue;
        }
        if !seen.insert(goal) {
            errors.push(format!("sub-task {idx}: '{}' duplicates a sibling", spec.goal));
        }
    }

    if !errors.is_empty() {
        return Err(violation(errors.join("; ")));
    }

    let mut group_ids: Vec<u32> = specs.iter().map(|spec| spec.group).collect();
    group_ids.sort_unstable();
    group_ids.dedup();
    let groups = group_ids
        .into_iter()
        .map(|group| {
            specs
                .iter()
                .filter(|spec| spec.group == group)
                .cloned()
                .collect()
        })
        .collect();

    Ok(Plan { groups })
}

/// Reject delegating `goal` to `agent` when that agent already works the same
/// goal among the unresolved ancestors, or when the delegated task would sit
/// deeper than `max_depth`.
pub fn check_delegation(
    task: &TaskId,
    path: &[PathEntry],
    agent: &str,
    goal: &str,
    max_depth: usize,
) -> Result<(), CoreError> {
    if path.len() > max_depth {
        return Err(CoreError::DecompositionInvariantViolation {
            task: task.to_string(),
            detail: format!(
                "delegated task would sit at depth {} beyond the limit of {max_depth}",
                path.len()
            ),
        });
    }
    let goal = normalize(goal);
    if goal.is_empty() {
        return Err(CoreError::DecompositionInvariantViolation {
            task: task.to_string(),
            detail: "delegated goal is empty".to_string(),
        });
    }
    if path
        .iter()
        .any(|entry| entry.agent == agent && normalize(&entry.goal) == goal)
    {
        return Err(CoreError::DecompositionInvariantViolation {
            task: task.to_string(),
            detail: format!("delegating '{goal}' to {agent} would form a cycle"),
        });
    }
    Ok(())
}
