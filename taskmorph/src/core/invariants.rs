//! Structural invariants of a finished task tree.

use std::collections::HashSet;

use crate::core::state_machine::RunState;
use crate::core::types::TaskStatus;
use crate::tree::{Task, TaskOrigin, TaskTree};

/// Check invariants that must hold once a run has returned:
/// - every task has reached a terminal status
/// - parent links, lineage and sequence numbers are consistent
/// - a task that succeeded from its children did so with every required
///   sub-task of its last round succeeded, or with its last delegate succeeded
pub fn validate_tree(tree: &TaskTree) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let root_lineage = tree.root_id();

    for task in tree.tasks() {
        if !seen.insert(task.id.clone()) {
            errors.push(format!("duplicate id '{}'", task.id));
        }
        if !task.status.is_terminal() {
            errors.push(format!("{}: status {} is not terminal", task.id, task.status));
        }
        if &task.lineage != root_lineage {
            errors.push(format!("{}: lineage {} differs from root", task.id, task.lineage));
        }

        match &task.parent {
            None if &task.id != root_lineage => {
                errors.push(format!("{}: only the root may lack a parent", task.id));
            }
            None => {}
            Some(parent_id) => match tree.get(parent_id) {
                Ok(parent) => {
                    if !parent.children.contains(&task.id) {
                        errors.push(format!("{}: parent does not list it", task.id));
                    }
                    if parent.seq >= task.seq {
                        errors.push(format!("{}: seq is not after its parent", task.id));
                    }
                }
                Err(_) => errors.push(format!("{}: parent {parent_id} is missing", task.id)),
            },
        }

        if task.status == TaskStatus::Succeeded && ends_by_awaiting_children(&task.states) {
            check_final_wave(tree, task, &mut errors);
        }
    }

    errors
}

fn ends_by_awaiting_children(states: &[RunState]) -> bool {
    states.ends_with(&[RunState::AwaitingChildren, RunState::Completed])
}

fn check_final_wave(tree: &TaskTree, task: &Task, errors: &mut Vec<String>) {
    let mut last_delegate: Option<&Task> = None;
    for child_id in &task.children {
        let Ok(child) = tree.get(child_id) else {
            errors.push(format!("{}: child {child_id} is missing", task.id));
            continue;
        };
        if child.wave != task.waves {
            continue;
        }
        match child.origin {
            TaskOrigin::Subtask { optional: false, .. } if child.status != TaskStatus::Succeeded => {
                errors.push(format!(
                    "{}: succeeded with required sub-task {} {}",
                    task.id, child.id, child.status
                ));
            }
            TaskOrigin::Delegation { .. } => last_delegate = Some(child),
            _ => {}
        }
    }
    if let Some(child) = last_delegate
        && child.status != TaskStatus::Succeeded
    {
        errors.push(format!(
            "{}: succeeded although its last delegate {} ended {}",
            task.id, child.id, child.status
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_unfinished_tasks_and_failed_required_children() {
        let mut tree = TaskTree::new_root("a", "big goal", json!({}), false);
        let root = tree.root_id().clone();
        for state in [RunState::Deciding, RunState::Dispatching, RunState::Decomposing] {
            tree.push_state(&root, state).expect("state");
        }
        tree.begin_wave(&root).expect("wave");
        let child = tree
            .add_child(
                &root,
                "a",
                "goal",
                json!({}),
                TaskOrigin::Subtask {
                    group: 0,
                    optional: false,
                },
            )
            .expect("child");

        let errors = validate_tree(&tree);
        assert_eq!(errors.len(), 2, "{errors:?}");

        tree.set_status(&child, TaskStatus::InProgress).expect("start");
        tree.set_status(&child, TaskStatus::Failed).expect("fail");
        tree.set_status(&root, TaskStatus::InProgress).expect("start");
        tree.set_status(&root, TaskStatus::Succeeded).expect("finish");
        tree.push_state(&root, RunState::AwaitingChildren).expect("await");
        tree.push_state(&root, RunState::Completed).expect("complete");
        let errors = validate_tree(&tree);
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("required sub-task"));
    }

    #[test]
    fn children_of_an_abandoned_round_do_not_count() {
        let mut tree = TaskTree::new_root("a", "big goal", json!({}), false);
        let root = tree.root_id().clone();
        tree.begin_wave(&root).expect("wave");
        let failed = tree
            .add_child(
                &root,
                "a",
                "first try",
                json!({}),
                TaskOrigin::Subtask {
                    group: 0,
                    optional: false,
                },
            )
            .expect("child");
        tree.set_status(&failed, TaskStatus::InProgress).expect("start");
        tree.set_status(&failed, TaskStatus::Failed).expect("fail");
        tree.begin_wave(&root).expect("wave");
        let delegated = tree
            .add_child(
                &root,
                "b",
                "second try",
                json!({}),
                TaskOrigin::Delegation {
                    action: "b".to_string(),
                    attempt: 1,
                },
            )
            .expect("child");
        tree.set_status(&delegated, TaskStatus::InProgress).expect("start");
        tree.set_status(&delegated, TaskStatus::Succeeded).expect("finish");
        for state in [
            RunState::Deciding,
            RunState::Dispatching,
            RunState::Decomposing,
            RunState::AwaitingChildren,
            RunState::Completed,
        ] {
            tree.push_state(&root, state).expect("state");
        }
        tree.set_status(&root, TaskStatus::InProgress).expect("start");
        tree.set_status(&root, TaskStatus::Succeeded).expect("finish");

        assert!(validate_tree(&tree).is_empty());
    }
}
