//! Run coordinator states and their legal transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Deciding,
    Dispatching,
    Decomposing,
    AwaitingChildren,
    Completed,
    Failed,
    CannotComplete,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Deciding => "deciding",
            RunState::Dispatching => "dispatching",
            RunState::Decomposing => "decomposing",
            RunState::AwaitingChildren => "awaiting_children",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::CannotComplete => "cannot_complete",
        }
    }

    /// Whether the coordinator may move from `self` to `next`.
    ///
    /// `Failed` is terminal unless the learn path re-enters `Deciding` or
    /// gives up with `CannotComplete`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::{
            AwaitingChildren, CannotComplete, Completed, Created, Deciding, Decomposing,
            Dispatching, Failed,
        };
        matches!(
            (self, next),
            (Created, Deciding)
                | (Deciding, Dispatching | Failed)
                | (
                    Dispatching,
                    Decomposing | Completed | CannotComplete | Deciding | Failed
                )
                | (Decomposing, AwaitingChildren | Failed)
                | (
                    AwaitingChildren,
                    Completed | Failed | Deciding | CannotComplete
                )
                | (Failed, Deciding | CannotComplete)
        )
    }

    /// Task status reached when a run stops in this state.
    pub fn final_status(self) -> Option<TaskStatus> {
        match self {
            RunState::Completed => Some(TaskStatus::Succeeded),
            RunState::Failed => Some(TaskStatus::Failed),
            RunState::CannotComplete => Some(TaskStatus::CannotComplete),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_paths_are_legal() {
        let leaf = [
            RunState::Created,
            RunState::Deciding,
            RunState::Dispatching,
            RunState::Deciding,
            RunState::Dispatching,
            RunState::Completed,
        ];
        let delegated = [
            RunState::Created,
            RunState::Deciding,
            RunState::Dispatching,
            RunState::Decomposing,
            RunState::AwaitingChildren,
            RunState::Completed,
        ];
        for path in [&leaf[..], &delegated[..]] {
            for pair in path.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn learn_path_reenters_deciding_from_failed() {
        assert!(RunState::Failed.can_transition_to(RunState::Deciding));
        assert!(RunState::Failed.can_transition_to(RunState::CannotComplete));
        assert!(!RunState::Failed.can_transition_to(RunState::Completed));
    }

    #[test]
    fn terminal_states_do_not_resume() {
        for next in [RunState::Deciding, RunState::Dispatching, RunState::Failed] {
            assert!(!RunState::Completed.can_transition_to(next));
            assert!(!RunState::CannotComplete.can_transition_to(next));
        }
        assert!(!RunState::Created.can_transition_to(RunState::Dispatching));
        assert!(!RunState::Deciding.can_transition_to(RunState::Completed));
    }
}
