//! Folding child results back into their parent.

use serde::Serialize;
use serde_json::{Value, json};

use crate::core::types::{TaskId, TaskStatus};
use crate::tree::Task;

/// What a parent needs to know about one finished child.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildSummary {
    pub id: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    pub optional: bool,
    pub output: Value,
}

impl ChildSummary {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            goal: task.goal.clone(),
            status: task.status,
            optional: task.is_optional(),
            output: task.output.clone().unwrap_or(Value::Null),
        }
    }

    /// A required child that did not succeed fails its parent.
    pub fn fails_parent(&self) -> bool {
        !self.optional && self.status != TaskStatus::Succeeded
    }
}

/// Children that keep the parent from completing.
pub fn required_failures(children: &[ChildSummary]) -> Vec<&ChildSummary> {
    children.iter().filter(|child| child.fails_parent()).collect()
}

/// Outputs of succeeded children, passed to the next execution group.
pub fn prior_outputs(children: &[ChildSummary]) -> Value {
    Value::Array(
        children
            .iter()
            .filter(|child| child.status == TaskStatus::Succeeded)
            .map(|child| json!({"goal": child.goal, "output": child.output}))
            .collect(),
    )
}

/// Parent payload after all children finished.
pub fn aggregate(children: &[ChildSummary]) -> Value {
    json!({
        "children": children
            .iter()
            .map(|child| json!({
                "id": child.id,
                "goal": child.goal,
                "status": child.status,
                "output": child.output,
            }))
            .collect::<Vec<_>>()
    })
}
