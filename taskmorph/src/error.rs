//! Error taxonomy for decision and dispatch failures.
//!
//! `CoreError` values travel inside `anyhow::Error` through the orchestration
//! layer; the coordinator downcasts them where it must branch on the kind.
//! `cannot_complete` is deliberately absent: it is a reasoned terminal status,
//! not an error.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of a failed action, recorded in memory and outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input or output violated the action's declared schema.
    ContractViolation,
    /// The action is absent from the task's action space snapshot.
    ActionUnavailable,
    /// Transient tool, delegate or provider failure.
    ExternalFailure,
    /// A sub-task failed the monotonic-progress or cycle checks.
    DecompositionInvariantViolation,
    /// An approval-gated tool was refused.
    ApprovalDenied,
    /// The task was cancelled by its parent or the operator.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::ActionUnavailable => "action_unavailable",
            ErrorKind::ExternalFailure => "external_failure",
            ErrorKind::DecompositionInvariantViolation => "decomposition_invariant_violation",
            ErrorKind::ApprovalDenied => "approval_denied",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Only transient external failures are retried locally.
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::ExternalFailure
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("action '{action}' is not in the current action space")]
    ActionUnavailable { action: String },

    #[error("external failure: {0}")]
    ExternalFailure(String),

    #[error("decomposition invariant violated for task {task}: {detail}")]
    DecompositionInvariantViolation { task: String, detail: String },

    #[error("task cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ActionUnavailable { .. } => ErrorKind::ActionUnavailable,
            CoreError::ExternalFailure(_) => ErrorKind::ExternalFailure,
            CoreError::DecompositionInvariantViolation { .. } => {
                ErrorKind::DecompositionInvariantViolation
            }
            CoreError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Classify an orchestration error, if it carries a `CoreError`.
pub fn core_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<CoreError>().map(CoreError::kind)
}
