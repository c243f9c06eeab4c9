//! Test-only providers, tools and fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::context::{CancelToken, RunContext};
use crate::core::action_space::{Action, ActionSpace, Tool};
use crate::core::types::Mode;
use crate::error::CoreError;
use crate::io::config::RunnerConfig;
use crate::io::memory_store::MemoryStore;
use crate::io::provider::{DecisionProvider, ProposalRequest};
use crate::io::tools::FnTool;
use crate::tree::{Task, TaskTree};

/// Provider answering from a per-agent queue of candidates.
///
/// An exhausted queue answers with an external failure.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Value>>>,
    requests: Arc<Mutex<Vec<ProposalRequest>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, agent: &str, candidates: Vec<Value>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(agent.to_string())
                .or_default()
                .extend(candidates);
        }
        self
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Arc<Mutex<Vec<ProposalRequest>>> {
        Arc::clone(&self.requests)
    }
}

impl DecisionProvider for ScriptedProvider {
    fn propose(&self, request: &ProposalRequest) -> Result<Value> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests poisoned"))?
            .push(request.clone());
        self.scripts
            .lock()
            .map_err(|_| anyhow!("scripts poisoned"))?
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                CoreError::ExternalFailure(format!("no scripted candidate for {}", request.agent))
                    .into()
            })
    }
}

/// Provider computing each candidate from the request.
pub struct FnProvider<F> {
    f: F,
}

impl<F> FnProvider<F>
where
    F: Fn(&ProposalRequest) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> DecisionProvider for FnProvider<F>
where
    F: Fn(&ProposalRequest) -> Result<Value> + Send + Sync,
{
    fn propose(&self, request: &ProposalRequest) -> Result<Value> {
        (self.f)(request)
    }
}

/// Tool returning queued results in order, counting calls.
pub struct ScriptedTool {
    results: Mutex<VecDeque<Result<Value>>>,
    calls: Arc<Mutex<usize>>,
}

impl ScriptedTool {
    pub fn new(results: Vec<Result<Value>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.calls)
    }
}

impl Tool for ScriptedTool {
    fn invoke(&self, _input: &Value) -> Result<Value> {
        *self.calls.lock().map_err(|_| anyhow!("calls poisoned"))? += 1;
        self.results
            .lock()
            .map_err(|_| anyhow!("results poisoned"))?
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("tool script exhausted")))
    }
}

/// Tool at version 1 that echoes its input, with unconstrained schemas.
pub fn echo_tool(name: &str) -> Action {
    Action::tool(
        name,
        "1",
        format!("{name} (echo)"),
        json!({}),
        json!({}),
        Arc::new(FnTool::new(name, |input: &Value| Ok(input.clone()))),
    )
}

/// Tool at version 1 backed by `tool`.
pub fn tool_action(name: &str, input_schema: Value, output_schema: Value, tool: ScriptedTool) -> Action {
    Action::tool(name, "1", name, input_schema, output_schema, Arc::new(tool))
}

pub fn root_task(agent: &str, goal: &str) -> Task {
    let tree = TaskTree::new_root(agent, goal, json!({}), false);
    tree.root().cloned().expect("fresh tree has a root")
}

/// Learn-mode context for deciding `task` directly.
pub fn context_for(task: &Task, space: Arc<ActionSpace>, memory: Arc<dyn MemoryStore>) -> RunContext {
    RunContext {
        agent: task.agent.clone(),
        space,
        memory,
        mode: Mode::Learn,
        lineage: task.lineage.clone(),
        dry_run: false,
        recursive: true,
        cancel: CancelToken::new(),
    }
}

/// Defaults without backoff sleeps.
pub fn test_config() -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.dispatch.initial_backoff_ms = 0;
    config.dispatch.max_backoff_ms = 0;
    config
}
