//! Approval gates for morph diffs and approval-gated tools.

use serde_json::Value;

use crate::core::action_space::{ActionSpaceDiff, ActionSpec};

/// Human or automated sign-off. Calls may block while waiting for a decision.
pub trait Approver: Send + Sync {
    /// Approve adding `diff` to `agent`'s action space.
    fn approve_diff(&self, agent: &str, diff: &ActionSpaceDiff) -> bool;

    /// Approve one invocation of a tool that declares `requires_approval`.
    fn approve_invocation(&self, _action: &ActionSpec, _input: &Value) -> bool {
        true
    }
}

/// Approves everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

impl Approver for AutoApprove {
    fn approve_diff(&self, _agent: &str, _diff: &ActionSpaceDiff) -> bool {
        true
    }
}

/// Refuses everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl Approver for DenyAll {
    fn approve_diff(&self, _agent: &str, _diff: &ActionSpaceDiff) -> bool {
        false
    }

    fn approve_invocation(&self, _action: &ActionSpec, _input: &Value) -> bool {
        false
    }
}
