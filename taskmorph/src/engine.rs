//! Decision engine: one validated next step per call.
//!
//! The engine asks the provider for a candidate, validates it against the
//! closed decision set and the task's action space snapshot, and re-asks with
//! a stricter contract when the candidate is rejected. It never returns an
//! action that is absent from the snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::context::RunContext;
use crate::core::action_space::ActionSpec;
use crate::core::candidate::{candidate_schema, parse_candidate};
use crate::core::types::{
    ActionRef, Decision, DecisionKind, MemoryKind, MemoryRecord, Mode, TaskId,
};
use crate::error::CoreError;
use crate::io::config::EngineConfig;
use crate::io::memory_store::{NewRecord, current_facts, records_from};
use crate::io::prompt::{PromptInputs, render_decision_prompt};
use crate::io::provider::{DecisionProvider, ProposalRequest};
use crate::tree::Task;

pub struct DecisionEngine {
    provider: Arc<dyn DecisionProvider>,
    config: EngineConfig,
}

impl DecisionEngine {
    pub fn new(provider: Arc<dyn DecisionProvider>, config: EngineConfig) -> Self {
        Self { provider, config }
    }

    /// Choose the next step for `task`.
    ///
    /// Appends one `reasoning-trace` record per proposal, accepted or not.
    /// Fails with `ExternalFailure` once every proposal was rejected.
    #[instrument(skip_all, fields(task = %task.id, agent = %ctx.agent, dry_run = ctx.dry_run))]
    pub fn decide(&self, task: &Task, ctx: &RunContext) -> Result<Decision> {
        let records = ctx
            .memory
            .lineage(&ctx.lineage)
            .with_context(|| format!("read memory for {}", ctx.lineage))?;
        let failed = failed_invocations(&records, &task.id);
        let visible = visible_memory(&records, ctx.mode);
        let window = visible
            .len()
            .saturating_sub(self.config.memory_window);
        let memory = &visible[window..];

        let actions: Vec<ActionSpec> = ctx.space.actions().map(|a| a.spec.clone()).collect();
        let schema = candidate_schema();
        let mut rejections: Vec<String> = Vec::new();

        for attempt in 1..=self.config.max_proposal_attempts {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled.into());
            }
            let strict = attempt > 1;
            let prompt = render_decision_prompt(
                &PromptInputs {
                    agent: &ctx.agent,
                    task_id: task.id.as_str(),
                    goal: &task.goal,
                    input: &task.input,
                    actions: &actions,
                    memory,
                    rejections: &rejections,
                    schema,
                    strict,
                    dry_run: ctx.dry_run,
                },
                self.config.prompt_budget_bytes,
            )?;
            let request = ProposalRequest {
                agent: ctx.agent.clone(),
                task_id: task.id.clone(),
                goal: task.goal.clone(),
                input: task.input.clone(),
                actions: actions.clone(),
                mode: ctx.mode,
                memory: memory.to_vec(),
                rejections: rejections.clone(),
                attempt,
                strict,
                dry_run: ctx.dry_run,
                prompt,
            };

            let candidate = match self.provider.propose(&request) {
                Ok(candidate) => candidate,
                Err(err) => {
                    warn!(attempt, err = %format!("{err:#}"), "provider failed");
                    let message = format!("provider error: {err:#}");
                    self.trace(task, ctx, attempt, &Value::Null, None, &[message.clone()])?;
                    rejections.push(message);
                    continue;
                }
            };

            let checked = parse_candidate(&candidate, &ctx.space, ctx.dry_run)
                .and_then(|decision| check_recursion(decision, ctx.recursive))
                .and_then(|decision| check_repeat(decision, &failed));
            match checked {
                Ok(decision) => {
                    self.trace(task, ctx, attempt, &candidate, Some(&decision), &[])?;
                    info!(
                        attempt,
                        decision = decision.kind.as_str(),
                        action = ?decision.action.as_ref().map(ToString::to_string),
                        "decided"
                    );
                    return Ok(decision);
                }
                Err(messages) => {
                    debug!(attempt, ?messages, "candidate rejected");
                    self.trace(task, ctx, attempt, &candidate, None, &messages)?;
                    rejections.extend(messages);
                }
            }
        }

        Err(CoreError::ExternalFailure(format!(
            "no acceptable decision for {} after {} proposals: {}",
            task.id,
            self.config.max_proposal_attempts,
            rejections.join("; ")
        ))
        .into())
    }

    fn trace(
        &self,
        task: &Task,
        ctx: &RunContext,
        attempt: u32,
        candidate: &Value,
        decision: Option<&Decision>,
        rejections: &[String],
    ) -> Result<MemoryRecord> {
        ctx.memory
            .append(NewRecord::new(
                &ctx.lineage,
                &task.id,
                MemoryKind::ReasoningTrace,
                json!({
                    "attempt": attempt,
                    "space_version": ctx.space.version(),
                    "accepted": decision.is_some(),
                    "candidate": candidate,
                    "decision": decision,
                    "rejections": rejections,
                }),
            ))
            .context("append reasoning trace")
    }
}

/// Records the provider may see. Learned facts are shown only while
/// learning, and then only the current value of each key.
fn visible_memory(records: &[MemoryRecord], mode: Mode) -> Vec<MemoryRecord> {
    let current: HashSet<u64> = match mode {
        Mode::Learn => current_facts(records)
            .values()
            .map(|record| record.seq)
            .collect(),
        Mode::Morph => HashSet::new(),
    };
    records
        .iter()
        .filter(|record| record.kind != MemoryKind::LearnedFact || current.contains(&record.seq))
        .cloned()
        .collect()
}

/// Invocations (action and input) that already produced a failure reason.
fn failed_invocations(records: &[MemoryRecord], task: &TaskId) -> HashSet<(ActionRef, String)> {
    records_from(records, task, MemoryKind::FailureReason)
        .into_iter()
        .filter_map(|record| {
            let action: ActionRef =
                serde_json::from_value(record.payload.get("action")?.clone()).ok()?;
            let input = record.payload.get("input").cloned().unwrap_or(Value::Null);
            Some((action, input.to_string()))
        })
        .collect()
}

fn check_recursion(decision: Decision, recursive: bool) -> Result<Decision, Vec<String>> {
    if decision.kind == DecisionKind::Decompose && !recursive {
        return Err(vec![
            "this agent may not decompose tasks; invoke an action or declare cannot-complete"
                .to_string(),
        ]);
    }
    Ok(decision)
}

fn check_repeat(
    decision: Decision,
    failed: &HashSet<(ActionRef, String)>,
) -> Result<Decision, Vec<String>> {
    if let Some(action) = &decision.action
        && failed.contains(&(action.clone(), decision.input.to_string()))
    {
        return Err(vec![format!(
            "{action} with this input already failed for this task; choose a different step"
        )]);
    }
    Ok(decision)
}
