//! Validation of untrusted provider candidates into a closed `Decision`.
//!
//! A candidate is checked in two passes: first against the candidate JSON
//! Schema, then against the action space snapshot. Rejections are returned
//! as human-readable messages so the engine can feed them back to the
//! provider on the next, stricter proposal.

use std::sync::LazyLock;

use jsonschema::{Validator, validator_for};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::core::action_space::ActionSpace;
use crate::core::types::{
    ActionKind, ActionRef, CapabilityHint, Decision, DecisionKind, SubTaskSpec,
};

static CANDIDATE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    serde_json::from_str(include_str!("../../schemas/decision_candidate.schema.json"))
        .expect("embedded candidate schema is valid JSON")
});

static CANDIDATE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    validator_for(&CANDIDATE_SCHEMA).expect("embedded candidate schema compiles")
});

#[derive(Debug, Deserialize)]
struct Candidate {
    decision: DecisionKind,
    #[serde(default)]
    action: Option<CandidateAction>,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    completes_task: bool,
    #[serde(default)]
    sub_tasks: Vec<SubTaskSpec>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    wanted: Vec<CapabilityHint>,
}

#[derive(Debug, Deserialize)]
struct CandidateAction {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

/// The candidate JSON Schema, as shown to providers.
pub fn candidate_schema() -> &'static Value {
    &CANDIDATE_SCHEMA
}

/// Turn a raw candidate into a `Decision` that only references `space`.
///
/// With `dry_run` set, an invocation of an absent action is not a rejection:
/// it is captured as a wanted capability and the decision becomes
/// `cannot-complete`.
pub fn parse_candidate(
    candidate: &Value,
    space: &ActionSpace,
    dry_run: bool,
) -> Result<Decision, Vec<String>> {
    let violations: Vec<String> = CANDIDATE_VALIDATOR
        .iter_errors(candidate)
        .map(|err| err.to_string())
        .collect();
    if !violations.is_empty() {
        return Err(violations);
    }

    let parsed: Candidate = serde_json::from_value(candidate.clone())
        .map_err(|err| vec![format!("candidate does not deserialize: {err}")])?;

    let input = if parsed.input.is_null() {
        json!({})
    } else {
        parsed.input
    };

    match parsed.decision {
        DecisionKind::InvokeTool | DecisionKind::InvokeDelegate => {
            let expected = if parsed.decision == DecisionKind::InvokeTool {
                ActionKind::Tool
            } else {
                ActionKind::Delegate
            };
            let Some(requested) = parsed.action else {
                return Err(vec![format!(
                    "{} requires an action",
                    parsed.decision.as_str()
                )]);
            };

            match resolve_action(space, &requested, expected) {
                Ok(reference) => Ok(Decision {
                    kind: parsed.decision,
                    action: Some(reference),
                    input,
                    completes_task: parsed.completes_task,
                    sub_tasks: Vec::new(),
                    reason: parsed.reason,
                    wanted: parsed.wanted,
                }),
                Err(message) if dry_run => {
                    let mut wanted = parsed.wanted;
                    let hint = CapabilityHint {
                        kind: expected,
                        name: requested.name,
                        description: parsed.reason.clone(),
                    };
                    if !wanted.iter().any(|w| w.kind == hint.kind && w.name == hint.name) {
                        wanted.push(hint);
                    }
                    Ok(Decision::cannot_complete(message, wanted))
                }
                Err(message) => Err(vec![message]),
            }
        }
        DecisionKind::Decompose => Ok(Decision {
            kind: DecisionKind::Decompose,
            action: None,
            input: Value::Null,
            completes_task: false,
            sub_tasks: parsed.sub_tasks,
            reason: parsed.reason,
            wanted: parsed.wanted,
        }),
        DecisionKind::CannotComplete => Ok(Decision::cannot_complete(parsed.reason, parsed.wanted)),
    }
}

fn resolve_action(
    space: &ActionSpace,
    requested: &CandidateAction,
    expected: ActionKind,
) -> Result<ActionRef, String> {
    let Some(action) = space.get(&requested.name) else {
        return Err(format!(
            "action '{}' is not in the action space (available: {})",
            requested.name,
            available(space)
        ));
    };
    if let Some(version) = &requested.version
        && *version != action.spec.version
    {
        return Err(format!(
            "action '{}' has version {}, not {version}",
            requested.name, action.spec.version
        ));
    }
    if action.spec.kind() != expected {
        return Err(format!(
            "action '{}' is a {}, not a {}",
            requested.name,
            action.spec.kind().as_str(),
            expected.as_str()
        ));
    }
    Ok(action.reference())
}

fn available(space: &ActionSpace) -> String {
    if space.is_empty() {
        return "none".to_string();
    }
    space
        .references()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
