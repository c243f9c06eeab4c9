//! End-to-end runs through the coordinator with scripted providers.

use std::sync::Arc;

use anyhow::anyhow;
use serde_json::{Value, json};

use taskmorph::context::CancelToken;
use taskmorph::coordinator::{RunCoordinator, RunRequest, TaskReport};
use taskmorph::core::action_space::Action;
use taskmorph::core::state_machine::RunState;
use taskmorph::core::types::{ActionRef, MemoryKind, Mode, TaskStatus};
use taskmorph::error::ErrorKind;
use taskmorph::io::approval::AutoApprove;
use taskmorph::io::catalog::Catalog;
use taskmorph::io::config::RunnerConfig;
use taskmorph::io::memory_store::{InMemoryStore, JsonlMemoryStore, MemoryStore};
use taskmorph::io::provider::{DecisionProvider, ProposalRequest};
use taskmorph::io::registry::{ActionRegistry, AgentDefinition};
use taskmorph::test_support::{
    FnProvider, ScriptedProvider, ScriptedTool, echo_tool, test_config, tool_action,
};
use taskmorph::tree::TaskOrigin;

struct Harness {
    registry: Arc<ActionRegistry>,
    catalog: Catalog,
    memory: Arc<dyn MemoryStore>,
    config: RunnerConfig,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: Arc::new(ActionRegistry::new()),
            catalog: Catalog::new(),
            memory: Arc::new(InMemoryStore::new()),
            config: test_config(),
        }
    }

    fn agent(self, name: &str, actions: Vec<Action>) -> Self {
        self.registry
            .register_agent(AgentDefinition::new(name, ""), actions)
            .expect("register agent");
        self
    }

    fn coordinator(mut self, provider: impl DecisionProvider + 'static) -> RunCoordinator {
        self.catalog.finalize().expect("finalize catalog");
        RunCoordinator::new(
            self.config,
            self.registry,
            Arc::new(self.catalog),
            self.memory,
            Arc::new(provider),
            Arc::new(AutoApprove),
        )
        .expect("coordinator")
    }
}

fn text_schema(field: &str) -> Value {
    json!({"type": "object", "required": [field], "properties": {field: {"type": "string"}}})
}

fn invoke_tool(name: &str, input: Value, completes: bool) -> Value {
    json!({
        "decision": "invoke-tool",
        "action": {"name": name},
        "input": input,
        "completes_task": completes,
        "reason": format!("use {name}"),
    })
}

fn attempt_statuses(report: &TaskReport) -> Vec<String> {
    report
        .records(&report.task_id, MemoryKind::AttemptResult)
        .iter()
        .map(|record| record.payload["status"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn sequential_tools_complete_a_task() {
    let fetch = ScriptedTool::new(vec![Ok(json!({"text": "full document"}))]);
    let summarize = ScriptedTool::new(vec![Ok(json!({"summary": "short"}))]);
    let coordinator = Harness::new()
        .agent(
            "summarizer",
            vec![
                tool_action("fetch-document", text_schema("doc"), text_schema("text"), fetch),
                tool_action("summarize-text", json!({}), text_schema("summary"), summarize),
            ],
        )
        .coordinator(ScriptedProvider::new().script(
            "summarizer",
            vec![
                invoke_tool("fetch-document", json!({"doc": "X"}), false),
                invoke_tool("summarize-text", json!({"text": "full document"}), true),
            ],
        ));

    let report = coordinator
        .run(RunRequest::new("summarizer", "summarize document X"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Succeeded);
    assert_eq!(report.output, Some(json!({"summary": "short"})));
    assert_eq!(
        report.states,
        vec![
            RunState::Created,
            RunState::Deciding,
            RunState::Dispatching,
            RunState::Deciding,
            RunState::Dispatching,
            RunState::Completed,
        ]
    );
    assert_eq!(attempt_statuses(&report), vec!["success", "success"]);
    let actions: Vec<ActionRef> = report
        .records(&report.task_id, MemoryKind::AttemptResult)
        .iter()
        .map(|record| serde_json::from_value(record.payload["action"].clone()).expect("action"))
        .collect();
    assert_eq!(
        actions,
        vec![
            ActionRef::new("fetch-document", "1"),
            ActionRef::new("summarize-text", "1")
        ]
    );
}

fn negotiator_provider() -> impl DecisionProvider {
    FnProvider::new(|request: &ProposalRequest| {
        Ok(match request.agent.as_str() {
            "negotiator" => json!({
                "decision": "invoke-delegate",
                "action": {"name": "legal-reviewer"},
                "input": {"goal": "review contract clauses"},
                "completes_task": true,
                "reason": "legal review is needed before signing",
            }),
            "legal-reviewer" => invoke_tool("review-clauses", json!({"verdict": "acceptable"}), true),
            other => return Err(anyhow!("unexpected agent {other}")),
        })
    })
}

#[test]
fn morphing_adds_a_delegate_that_the_run_then_uses() {
    let mut harness = Harness::new()
        .agent("negotiator", Vec::new())
        .agent("legal-reviewer", vec![echo_tool("review-clauses")]);
    harness.config.mode = Mode::Morph;
    harness
        .catalog
        .add(Action::delegate(
            "legal-reviewer",
            "1",
            "reviews contracts",
            "legal-reviewer",
        ))
        .expect("catalog");
    let registry = Arc::clone(&harness.registry);
    let coordinator = harness.coordinator(negotiator_provider());

    let report = coordinator
        .run(RunRequest::new("negotiator", "negotiate contract"))
        .expect("run");

    assert!(report.morph[0].committed);
    assert_eq!(report.morph[0].wanted[0].name, "legal-reviewer");
    assert_eq!(report.morph[0].added, vec![ActionRef::new("legal-reviewer", "1")]);
    assert!(!report.morph.last().expect("last cycle").committed);
    assert_eq!(registry.snapshot("negotiator").expect("snapshot").version(), 2);

    assert_eq!(report.status, TaskStatus::Succeeded);
    assert!(report.states.ends_with(&[
        RunState::Dispatching,
        RunState::Decomposing,
        RunState::AwaitingChildren,
        RunState::Completed,
    ]));
    let children = report.children();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].agent, "legal-reviewer");
    assert_eq!(children[0].goal, "review contract clauses");
    assert_eq!(children[0].status, TaskStatus::Succeeded);
    assert_eq!(report.output, Some(json!({"verdict": "acceptable"})));
    assert_eq!(report.records(&report.task_id, MemoryKind::LearnedFact).len(), 1);
}

#[test]
fn production_runs_do_not_morph_without_auto_morph() {
    let mut harness = Harness::new()
        .agent("negotiator", Vec::new())
        .agent("legal-reviewer", vec![echo_tool("review-clauses")]);
    harness.config.mode = Mode::Morph;
    harness.config.production = true;
    harness
        .catalog
        .add(Action::delegate("legal-reviewer", "1", "", "legal-reviewer"))
        .expect("catalog");
    let registry = Arc::clone(&harness.registry);
    let coordinator = harness.coordinator(FnProvider::new(|_request: &ProposalRequest| {
        Ok(json!({
            "decision": "cannot-complete",
            "reason": "no legal reviewer available",
            "wanted": [{"kind": "delegate", "name": "legal-reviewer"}],
        }))
    }));

    let report = coordinator
        .run(RunRequest::new("negotiator", "negotiate contract"))
        .expect("run");
    assert!(report.morph.is_empty());
    assert_eq!(report.status, TaskStatus::CannotComplete);
    assert_eq!(registry.snapshot("negotiator").expect("snapshot").version(), 1);

    let report = coordinator
        .run(RunRequest::new("negotiator", "negotiate contract").auto_morph())
        .expect("run");
    assert!(report.morph[0].committed);
    assert_eq!(registry.snapshot("negotiator").expect("snapshot").version(), 2);
}

#[test]
fn output_contract_violation_fails_without_retry() {
    let tool = ScriptedTool::new(vec![Ok(json!({"text": 7})), Ok(json!({"text": "fine"}))]);
    let calls = tool.calls();
    let provider = ScriptedProvider::new().script(
        "summarizer",
        vec![invoke_tool("summarize-text", json!({}), true)],
    );
    let requests = provider.requests();
    let coordinator = Harness::new()
        .agent(
            "summarizer",
            vec![tool_action("summarize-text", json!({}), text_schema("text"), tool)],
        )
        .coordinator(provider);

    let report = coordinator
        .run(RunRequest::new("summarizer", "summarize"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.error, Some(ErrorKind::ContractViolation));
    assert_eq!(report.states.last(), Some(&RunState::Failed));
    assert_eq!(*calls.lock().expect("calls"), 1);
    assert_eq!(requests.lock().expect("requests").len(), 1);
    assert_eq!(attempt_statuses(&report), vec!["failure"]);
    let reasons = report.records(&report.task_id, MemoryKind::FailureReason);
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0].payload["error_kind"], "contract_violation");
}

#[test]
fn failing_delegates_are_retried_until_one_succeeds() {
    let checker = ScriptedTool::new(vec![
        Ok(json!({"oops": true})),
        Ok(json!({"oops": true})),
        Ok(json!({"verdict": "clauses are fine"})),
    ]);
    let check = invoke_tool("check-clauses", json!({}), true);
    let coordinator = Harness::new()
        .agent(
            "negotiator",
            vec![Action::delegate("clause-checker", "1", "checks clauses", "clause-checker")],
        )
        .agent(
            "clause-checker",
            vec![tool_action("check-clauses", json!({}), text_schema("verdict"), checker)],
        )
        .coordinator(
            ScriptedProvider::new()
                .script(
                    "negotiator",
                    vec![json!({
                        "decision": "invoke-delegate",
                        "action": {"name": "clause-checker", "version": "1"},
                        "input": {"goal": "check the clauses"},
                        "completes_task": true,
                        "reason": "delegate clause checking",
                    })],
                )
                .script("clause-checker", vec![check.clone(), check.clone(), check]),
        );

    let report = coordinator
        .run(RunRequest::new("negotiator", "negotiate contract"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Succeeded);
    assert_eq!(attempt_statuses(&report), vec!["failure", "failure", "success"]);
    let attempts = report.records(&report.task_id, MemoryKind::AttemptResult);
    assert!(attempts.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    assert!(attempts.windows(2).all(|pair| pair[0].recorded_at <= pair[1].recorded_at));
    assert_eq!(attempts[0].payload["error_kind"], "external_failure");

    let children = report.children();
    assert_eq!(children.len(), 3);
    let statuses: Vec<TaskStatus> = children.iter().map(|child| child.status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Failed, TaskStatus::Failed, TaskStatus::Succeeded]
    );
    assert!(matches!(
        children[2].origin,
        TaskOrigin::Delegation { attempt: 3, .. }
    ));
}

#[test]
fn failures_feed_the_next_decision() {
    let mirror = ScriptedTool::new(vec![
        Err(anyhow!("mirror down")),
        Err(anyhow!("mirror down")),
        Err(anyhow!("mirror down")),
    ]);
    let provider = ScriptedProvider::new().script(
        "summarizer",
        vec![
            invoke_tool("fetch-mirror", json!({"doc": "X"}), true),
            invoke_tool("fetch-mirror", json!({"doc": "X"}), true),
            invoke_tool("fetch-document", json!({"doc": "X"}), true),
        ],
    );
    let requests = provider.requests();
    let coordinator = Harness::new()
        .agent(
            "summarizer",
            vec![
                tool_action("fetch-mirror", json!({}), json!({}), mirror),
                echo_tool("fetch-document"),
            ],
        )
        .coordinator(provider);

    let report = coordinator
        .run(RunRequest::new("summarizer", "fetch document X"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Succeeded);
    assert_eq!(report.output, Some(json!({"doc": "X"})));
    assert!(report
        .states
        .windows(2)
        .any(|pair| pair == [RunState::Failed, RunState::Deciding]));

    let reasons = report.records(&report.task_id, MemoryKind::FailureReason);
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0].payload["action"]["name"], "fetch-mirror");
    assert_eq!(reasons[0].payload["error_kind"], "external_failure");

    let seen = requests.lock().expect("requests");
    assert_eq!(seen.len(), 3);
    assert!(seen[2].rejections[0].contains("already failed"));
    assert!(
        seen[1]
            .memory
            .iter()
            .any(|record| record.kind == MemoryKind::FailureReason)
    );
}

#[test]
fn without_learning_a_transient_failure_is_final() {
    let mirror = ScriptedTool::new(vec![
        Err(anyhow!("mirror down")),
        Err(anyhow!("mirror down")),
        Err(anyhow!("mirror down")),
    ]);
    let mut harness = Harness::new().agent(
        "summarizer",
        vec![tool_action("fetch-mirror", json!({}), json!({}), mirror)],
    );
    harness.config.learn.enabled = false;
    let coordinator = harness.coordinator(ScriptedProvider::new().script(
        "summarizer",
        vec![invoke_tool("fetch-mirror", json!({}), true)],
    ));

    let report = coordinator
        .run(RunRequest::new("summarizer", "fetch"))
        .expect("run");
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.error, Some(ErrorKind::ExternalFailure));
    assert_eq!(attempt_statuses(&report).len(), 3);
}

#[test]
fn exhausted_learning_ends_in_cannot_complete() {
    let mut harness = Harness::new().agent("summarizer", vec![echo_tool("fetch-document")]);
    harness.config.learn.max_retries = 1;
    // Every proposal names an action the agent does not have.
    let coordinator = harness.coordinator(FnProvider::new(|_request: &ProposalRequest| {
        Ok(invoke_tool("teleport", json!({}), true))
    }));

    let report = coordinator
        .run(RunRequest::new("summarizer", "fetch"))
        .expect("run");
    assert_eq!(report.status, TaskStatus::CannotComplete);
    assert_eq!(report.states.last(), Some(&RunState::CannotComplete));
    assert!(report.records(&report.task_id, MemoryKind::AttemptResult).is_empty());
    assert_eq!(
        report.records(&report.task_id, MemoryKind::FailureReason).len(),
        2
    );
}

fn writer_provider(fail_goal: &'static str) -> impl DecisionProvider {
    FnProvider::new(move |request: &ProposalRequest| {
        Ok(match request.goal.as_str() {
            "write report" => json!({
                "decision": "decompose",
                "sub_tasks": [
                    {"goal": "draft introduction", "group": 0},
                    {"goal": "draft conclusion", "group": 0, "optional": true},
                    {"goal": "assemble final document", "group": 1},
                ],
                "reason": "split the writing",
            }),
            goal if goal == fail_goal => {
                json!({"decision": "cannot-complete", "reason": "nothing to say"})
            }
            goal => invoke_tool("compose", json!({"part": goal, "input": request.input}), true),
        })
    })
}

#[test]
fn decomposed_groups_run_in_order_and_pass_outputs_forward() {
    let coordinator = Harness::new()
        .agent("writer", vec![echo_tool("compose")])
        .coordinator(writer_provider("never"));

    let report = coordinator
        .run(RunRequest::new("writer", "write report"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Succeeded);
    assert!(report.states.ends_with(&[
        RunState::Decomposing,
        RunState::AwaitingChildren,
        RunState::Completed
    ]));
    let children = report.children();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|child| child.status == TaskStatus::Succeeded));
    assert!(children.windows(2).all(|pair| pair[0].seq < pair[1].seq));

    let prior = &children[2].input["prior_outputs"];
    assert_eq!(prior.as_array().map(Vec::len), Some(2));
    let output = report.output.expect("aggregate");
    assert_eq!(output["children"].as_array().map(Vec::len), Some(3));
    assert_eq!(output["children"][2]["output"]["part"], "assemble final document");
}

#[test]
fn failed_optional_children_do_not_fail_the_parent() {
    let coordinator = Harness::new()
        .agent("writer", vec![echo_tool("compose")])
        .coordinator(writer_provider("draft conclusion"));

    let report = coordinator
        .run(RunRequest::new("writer", "write report"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Succeeded);
    let children = report.children();
    assert_eq!(children[1].status, TaskStatus::CannotComplete);
    assert_eq!(children[2].input["prior_outputs"].as_array().map(Vec::len), Some(1));
}

#[test]
fn a_failed_required_child_skips_later_groups() {
    let mut harness = Harness::new().agent("writer", vec![echo_tool("compose")]);
    harness.config.learn.enabled = false;
    let coordinator = harness.coordinator(writer_provider("draft introduction"));

    let report = coordinator
        .run(RunRequest::new("writer", "write report"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Failed);
    let children = report.children();
    assert_eq!(children[0].status, TaskStatus::CannotComplete);
    let skipped = children[2];
    assert_eq!(skipped.status, TaskStatus::CannotComplete);
    assert_eq!(skipped.states, vec![RunState::Created]);
    let reasons = report.records(&skipped.id, MemoryKind::FailureReason);
    assert!(
        reasons[0].payload["detail"]
            .as_str()
            .unwrap_or_default()
            .contains("skipped")
    );
}

#[test]
fn invalid_decompositions_create_no_children() {
    let coordinator = Harness::new()
        .agent("writer", vec![echo_tool("compose")])
        .coordinator(FnProvider::new(|_request: &ProposalRequest| {
            Ok(json!({
                "decision": "decompose",
                "sub_tasks": [{"goal": "Write the report"}, {"goal": "proofread"}],
                "reason": "restate",
            }))
        }));

    let report = coordinator
        .run(RunRequest::new("writer", "write report"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.error, Some(ErrorKind::DecompositionInvariantViolation));
    assert_eq!(report.tree.len(), 1);
    assert!(!report.states.contains(&RunState::Decomposing));
}

#[test]
fn delegating_a_goal_back_to_its_own_agent_is_refused() {
    let coordinator = Harness::new()
        .agent(
            "reviewer",
            vec![Action::delegate("second-opinion", "1", "", "reviewer")],
        )
        .coordinator(ScriptedProvider::new().script(
            "reviewer",
            vec![json!({
                "decision": "invoke-delegate",
                "action": {"name": "second-opinion"},
                "input": {"goal": "Review   the contract"},
                "completes_task": true,
                "reason": "ask again",
            })],
        ));

    let report = coordinator
        .run(RunRequest::new("reviewer", "review the contract"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.error, Some(ErrorKind::DecompositionInvariantViolation));
    assert!(report.children().is_empty());
}

#[test]
fn alternating_delegation_stops_at_the_depth_limit() {
    let mut harness = Harness::new()
        .agent("ping", vec![Action::delegate("pong", "1", "", "pong")])
        .agent("pong", vec![Action::delegate("ping", "1", "", "ping")]);
    harness.config.decompose.max_depth = 3;
    harness.config.dispatch.max_attempts = 1;
    harness.config.learn.max_retries = 0;
    let coordinator = harness.coordinator(FnProvider::new(|request: &ProposalRequest| {
        let step: u32 = request
            .goal
            .trim_start_matches("step ")
            .parse()
            .map_err(|_| anyhow!("unexpected goal {}", request.goal))?;
        let other = if request.agent == "ping" { "pong" } else { "ping" };
        Ok(json!({
            "decision": "invoke-delegate",
            "action": {"name": other},
            "input": {"goal": format!("step {}", step + 1)},
            "completes_task": true,
            "reason": "hand the next step over",
        }))
    }));

    let report = coordinator
        .run(RunRequest::new("ping", "step 0"))
        .expect("run");

    assert_eq!(report.status, TaskStatus::CannotComplete);
    assert_eq!(report.tree.len(), 4);
    let deepest = report
        .tree
        .tasks()
        .max_by_key(|task| report.tree.depth(&task.id).expect("depth"))
        .expect("tasks");
    assert_eq!(report.tree.depth(&deepest.id).expect("depth"), 3);
    assert_eq!(deepest.goal, "step 3");
    assert_eq!(deepest.status, TaskStatus::Failed);
    assert_eq!(deepest.error, Some(ErrorKind::DecompositionInvariantViolation));
    assert!(deepest.children.is_empty());
}

#[test]
fn cancelled_runs_stop_before_deciding() {
    let provider = ScriptedProvider::new();
    let requests = provider.requests();
    let coordinator = Harness::new()
        .agent("summarizer", vec![echo_tool("fetch-document")])
        .coordinator(provider);
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = coordinator
        .run(RunRequest::new("summarizer", "summarize").with_cancel(cancel))
        .expect("run");

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.error, Some(ErrorKind::Cancelled));
    assert!(requests.lock().expect("requests").is_empty());
}

#[test]
fn step_budget_bounds_a_task() {
    let mut harness = Harness::new().agent("summarizer", vec![echo_tool("fetch-document")]);
    harness.config.engine.max_steps_per_task = 2;
    let coordinator = harness.coordinator(FnProvider::new(|_request: &ProposalRequest| {
        Ok(invoke_tool("fetch-document", json!({}), false))
    }));

    let report = coordinator
        .run(RunRequest::new("summarizer", "summarize"))
        .expect("run");
    assert_eq!(report.status, TaskStatus::CannotComplete);
    assert_eq!(
        report.states,
        vec![
            RunState::Created,
            RunState::Deciding,
            RunState::Dispatching,
            RunState::Deciding,
            RunState::Dispatching,
            RunState::CannotComplete,
        ]
    );
}

#[test]
fn unknown_agents_are_an_error() {
    let coordinator = Harness::new().coordinator(ScriptedProvider::new());
    assert!(coordinator.run(RunRequest::new("ghost", "haunt")).is_err());
}

#[test]
fn jsonl_memory_keeps_the_run_evidence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = Harness::new().agent("summarizer", vec![echo_tool("fetch-document")]);
    harness.memory = Arc::new(JsonlMemoryStore::open(dir.path()).expect("open"));
    let coordinator = harness.coordinator(ScriptedProvider::new().script(
        "summarizer",
        vec![invoke_tool("fetch-document", json!({"doc": "X"}), true)],
    ));

    let report = coordinator
        .run(RunRequest::new("summarizer", "fetch"))
        .expect("run");

    let reopened = JsonlMemoryStore::open(dir.path()).expect("reopen");
    let stored = reopened.lineage(&report.lineage).expect("lineage");
    assert_eq!(stored, report.evidence);
    assert!(stored.iter().any(|record| record.kind == MemoryKind::ReasoningTrace));
}
