//! Dispatcher: executes one decided action and records what happened.
//!
//! This is the only component that calls out of the process. Each attempt's
//! outcome is appended to memory before the next attempt or the return, except
//! when the task was cancelled while the call was in flight: such outcomes
//! are discarded.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::context::{CancelToken, RunContext};
use crate::core::action_space::{Action, ActionSpecKind};
use crate::core::retry::RetryPolicy;
use crate::core::schema::schema_errors;
use crate::core::types::{
    ActionRef, Decision, DecisionKind, MemoryKind, Outcome, TaskId, TaskStatus,
};
use crate::error::{ErrorKind, core_kind};
use crate::io::approval::Approver;
use crate::io::memory_store::NewRecord;
use crate::tree::Task;

/// A delegated task to run to completion under `parent`.
#[derive(Debug, Clone)]
pub struct DelegateRequest {
    pub action: ActionRef,
    pub agent: String,
    pub goal: String,
    pub input: Value,
    pub attempt: u32,
    pub cancel: CancelToken,
}

/// Terminal result of a delegated task.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub output: Value,
    pub error: Option<ErrorKind>,
}

/// Runs delegated tasks; implemented by the run coordinator.
pub trait DelegateRunner: Sync {
    fn run_delegate(&self, parent: &Task, request: DelegateRequest) -> Result<DelegateResult>;
}

struct Attempt {
    outcome: Outcome,
    child: Option<TaskId>,
}

impl Attempt {
    fn plain(outcome: Outcome) -> Self {
        Self {
            outcome,
            child: None,
        }
    }
}

pub struct Dispatcher {
    policy: RetryPolicy,
    approver: Arc<dyn Approver>,
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy, approver: Arc<dyn Approver>) -> Self {
        Self { policy, approver }
    }

    #[instrument(skip_all, fields(task = %task.id, decision = decision.kind.as_str()))]
    pub fn dispatch(
        &self,
        task: &Task,
        decision: &Decision,
        ctx: &RunContext,
        delegates: &dyn DelegateRunner,
    ) -> Result<Outcome> {
        match decision.kind {
            DecisionKind::CannotComplete => {
                let payload = json!({
                    "decision": DecisionKind::CannotComplete.as_str(),
                    "reason": decision.reason,
                    "wanted": decision.wanted,
                });
                ctx.memory.append(NewRecord::new(
                    &ctx.lineage,
                    &task.id,
                    MemoryKind::FailureReason,
                    payload.clone(),
                ))?;
                Ok(Outcome::failure(None, payload))
            }
            DecisionKind::Decompose => Err(anyhow!(
                "decompose decisions are expanded by the coordinator, not dispatched"
            )),
            DecisionKind::InvokeTool | DecisionKind::InvokeDelegate => {
                let Some(reference) = &decision.action else {
                    return Err(anyhow!("{} decision without an action", decision.kind.as_str()));
                };
                let Some(action) = ctx
                    .space
                    .get(&reference.name)
                    .filter(|action| action.spec.version == reference.version)
                else {
                    let outcome = Outcome::failure(
                        Some(ErrorKind::ActionUnavailable),
                        json!({"detail": format!("{reference} is not in action space v{}", ctx.space.version())}),
                    );
                    self.record(task, ctx, reference, 1, &decision.input, &Attempt::plain(outcome.clone()))?;
                    return Ok(outcome);
                };
                match &action.spec.kind {
                    ActionSpecKind::Tool { .. } => self.dispatch_tool(task, action, decision, ctx),
                    ActionSpecKind::Delegate { agent } => {
                        self.dispatch_delegate(task, action, agent, decision, ctx, delegates)
                    }
                }
            }
        }
    }

    fn dispatch_tool(
        &self,
        task: &Task,
        action: &Action,
        decision: &Decision,
        ctx: &RunContext,
    ) -> Result<Outcome> {
        let reference = action.reference();
        let input = &decision.input;
        let ActionSpecKind::Tool {
            input_schema,
            output_schema,
            requires_approval,
        } = &action.spec.kind
        else {
            return Err(anyhow!("{reference} is not a tool"));
        };

        if let Some(violation) = contract_violation(input_schema, input, "input") {
            warn!(action = %reference, "tool input violates its schema");
            let attempt = Attempt::plain(violation);
            self.record(task, ctx, &reference, 1, input, &attempt)?;
            return Ok(attempt.outcome);
        }

        if *requires_approval && !self.approver.approve_invocation(&action.spec, input) {
            let attempt = Attempt::plain(Outcome::failure(
                Some(ErrorKind::ApprovalDenied),
                json!({"detail": format!("invocation of {reference} was not approved")}),
            ));
            self.record(task, ctx, &reference, 1, input, &attempt)?;
            return Ok(attempt.outcome);
        }

        let Some(handler) = &action.handler else {
            let attempt = Attempt::plain(Outcome::failure(
                Some(ErrorKind::ActionUnavailable),
                json!({"detail": format!("{reference} has no handler")}),
            ));
            self.record(task, ctx, &reference, 1, input, &attempt)?;
            return Ok(attempt.outcome);
        };

        self.with_retries(task, ctx, &reference, input, |_attempt| {
            let outcome = match handler.invoke(input) {
                Ok(output) => contract_violation(output_schema, &output, "output")
                    .unwrap_or_else(|| Outcome::success(output)),
                Err(err) => Outcome::failure(
                    Some(core_kind(&err).unwrap_or(ErrorKind::ExternalFailure)),
                    json!({"detail": format!("{err:#}")}),
                ),
            };
            Ok(Attempt::plain(outcome))
        })
    }

    fn dispatch_delegate(
        &self,
        task: &Task,
        action: &Action,
        agent: &str,
        decision: &Decision,
        ctx: &RunContext,
        delegates: &dyn DelegateRunner,
    ) -> Result<Outcome> {
        let reference = action.reference();
        let goal = decision
            .input
            .get("goal")
            .and_then(Value::as_str)
            .filter(|goal| !goal.trim().is_empty())
            .unwrap_or(&task.goal)
            .to_string();

        self.with_retries(task, ctx, &reference, &decision.input, |attempt| {
            let request = DelegateRequest {
                action: reference.clone(),
                agent: agent.to_string(),
                goal: goal.clone(),
                input: decision.input.clone(),
                attempt,
                cancel: ctx.cancel.child(),
            };
            let outcome = match delegates.run_delegate(task, request) {
                Ok(result) => {
                    let child = Some(result.task_id.clone());
                    let outcome = match result.status {
                        TaskStatus::Succeeded => Outcome::success(result.output),
                        TaskStatus::CannotComplete => Outcome::failure(
                            None,
                            json!({"detail": "delegate cannot complete", "output": result.output}),
                        ),
                        status => Outcome::failure(
                            Some(match result.error {
                                Some(ErrorKind::Cancelled) => ErrorKind::Cancelled,
                                _ => ErrorKind::ExternalFailure,
                            }),
                            json!({
                                "detail": format!("delegate ended {status}"),
                                "child_error": result.error,
                            }),
                        ),
                    };
                    return Ok(Attempt { outcome, child });
                }
                Err(err) => Outcome::failure(
                    Some(core_kind(&err).unwrap_or(ErrorKind::ExternalFailure)),
                    json!({"detail": format!("{err:#}")}),
                ),
            };
            Ok(Attempt::plain(outcome))
        })
    }

    /// Run `call` until it succeeds, fails with a non-retryable kind, or the
    /// attempts run out, backing off between attempts.
    fn with_retries(
        &self,
        task: &Task,
        ctx: &RunContext,
        reference: &ActionRef,
        input: &Value,
        mut call: impl FnMut(u32) -> Result<Attempt>,
    ) -> Result<Outcome> {
        let mut attempt = 1;
        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(cancelled());
            }
            let result = call(attempt)?;
            if ctx.cancel.is_cancelled() {
                debug!(action = %reference, attempt, "discarding outcome of cancelled call");
                return Ok(cancelled());
            }
            self.record(task, ctx, reference, attempt, input, &result)?;

            let outcome = result.outcome;
            let retryable = outcome.error_kind.is_some_and(ErrorKind::is_retryable);
            if outcome.is_success() || !retryable || !self.policy.has_attempts_after(attempt) {
                return Ok(outcome);
            }
            let delay = self.policy.backoff_after(attempt);
            warn!(action = %reference, attempt, delay_ms = delay.as_millis() as u64, "retrying after external failure");
            sleep_unless_cancelled(delay, &ctx.cancel);
            attempt += 1;
        }
    }

    fn record(
        &self,
        task: &Task,
        ctx: &RunContext,
        reference: &ActionRef,
        attempt: u32,
        input: &Value,
        result: &Attempt,
    ) -> Result<()> {
        ctx.memory.append(NewRecord::new(
            &ctx.lineage,
            &task.id,
            MemoryKind::AttemptResult,
            json!({
                "action": reference,
                "attempt": attempt,
                "input": input,
                "status": result.outcome.status,
                "error_kind": result.outcome.error_kind,
                "payload": result.outcome.payload,
                "child": result.child,
            }),
        ))?;
        Ok(())
    }
}

/// Longest uninterrupted sleep while backing off.
const BACKOFF_SLICE: Duration = Duration::from_millis(20);

/// Sleep for `delay`, waking early once `cancel` fires.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        thread::sleep(left.min(BACKOFF_SLICE));
    }
}

fn cancelled() -> Outcome {
    Outcome::failure(
        Some(ErrorKind::Cancelled),
        json!({"detail": "cancelled while dispatching"}),
    )
}

/// A `ContractViolation` outcome if `value` does not satisfy `schema`.
fn contract_violation(schema: &Value, value: &Value, side: &str) -> Option<Outcome> {
    let detail = match schema_errors(schema, value) {
        Ok(errors) if errors.is_empty() => return None,
        Ok(errors) => errors.join("; "),
        Err(err) => format!("{err:#}"),
    };
    Some(Outcome::failure(
        Some(ErrorKind::ContractViolation),
        json!({"detail": format!("{side} violates schema: {detail}"), side: value}),
    ))
}
