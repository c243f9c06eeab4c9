//! Run coordinator: drives each task through its state machine.
//!
//! A run owns one task tree. Every task loops through `Deciding` and
//! `Dispatching` until the engine's step completes it, a failure ends it, or
//! its step budget runs out. Decompositions fan out into child tasks; sibling
//! tasks in one execution group run on scoped threads and later groups see the
//! outputs of earlier ones. Delegations run the target agent's task to
//! completion under the delegating task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::context::{CancelToken, RunContext};
use crate::core::action_space::ActionSpace;
use crate::core::aggregate::{ChildSummary, aggregate, prior_outputs, required_failures};
use crate::core::decomposer::{check_delegation, decompose};
use crate::core::invariants::validate_tree;
use crate::core::state_machine::RunState;
use crate::core::types::{
    ActionRef, Decision, DecisionKind, MemoryKind, MemoryRecord, Mode, TaskId, TaskStatus,
};
use crate::dispatcher::{DelegateRequest, DelegateResult, DelegateRunner, Dispatcher};
use crate::engine::DecisionEngine;
use crate::error::{CoreError, ErrorKind, core_kind};
use crate::io::approval::Approver;
use crate::io::catalog::Catalog;
use crate::io::config::RunnerConfig;
use crate::io::memory_store::{MemoryStore, NewRecord, records_from};
use crate::io::provider::DecisionProvider;
use crate::io::registry::ActionRegistry;
use crate::morph::{MorphController, MorphReport, MorphRequest};
use crate::tree::{Task, TaskOrigin, TaskTree};

/// A root task to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub agent: String,
    pub goal: String,
    pub input: Value,
    /// Allows morphing in production mode.
    pub auto_morph: bool,
    pub cancel: CancelToken,
}

impl RunRequest {
    pub fn new(agent: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            goal: goal.into(),
            input: json!({}),
            auto_morph: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn auto_morph(mut self) -> Self {
        self.auto_morph = true;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub lineage: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<ErrorKind>,
    pub states: Vec<RunState>,
    /// Memory records produced by the task and its descendants, in order.
    pub evidence: Vec<MemoryRecord>,
    pub morph: Vec<MorphReport>,
    pub tree: TaskTree,
}

impl TaskReport {
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tree.get(id).ok()
    }

    /// Evidence produced by one task.
    pub fn records(&self, source: &TaskId, kind: MemoryKind) -> Vec<&MemoryRecord> {
        records_from(&self.evidence, source, kind)
    }

    pub fn children(&self) -> Vec<&Task> {
        self.task(&self.task_id)
            .map(|root| {
                root.children
                    .iter()
                    .filter_map(|id| self.task(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct RunCoordinator {
    config: RunnerConfig,
    registry: Arc<ActionRegistry>,
    memory: Arc<dyn MemoryStore>,
    engine: DecisionEngine,
    dispatcher: Dispatcher,
    morph: MorphController,
}

impl RunCoordinator {
    pub fn new(
        config: RunnerConfig,
        registry: Arc<ActionRegistry>,
        catalog: Arc<Catalog>,
        memory: Arc<dyn MemoryStore>,
        provider: Arc<dyn DecisionProvider>,
        approver: Arc<dyn Approver>,
    ) -> Result<Self> {
        config.validate().context("invalid runner config")?;
        let engine = DecisionEngine::new(provider, config.engine.clone());
        let dispatcher = Dispatcher::new(config.retry_policy(), Arc::clone(&approver));
        let morph = MorphController::new(
            Arc::clone(&registry),
            catalog,
            approver,
            config.production,
            config.decompose_limits(),
        );
        Ok(Self {
            config,
            registry,
            memory,
            engine,
            dispatcher,
            morph,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run a root task to a terminal status.
    ///
    /// Task failures are reported through the returned status; `Err` means
    /// the run itself could not proceed (unknown agent, unreadable memory,
    /// a broken tree).
    #[instrument(skip_all, fields(agent = %request.agent, mode = ?self.config.mode))]
    pub fn run(&self, request: RunRequest) -> Result<TaskReport> {
        let definition = self.registry.definition(&request.agent)?;
        let tree = TaskTree::new_root(
            &request.agent,
            &request.goal,
            request.input.clone(),
            request.auto_morph,
        );
        let root_id = tree.root_id().clone();
        info!(task = %root_id, goal = %request.goal, "run started");

        let morph = if self.config.mode == Mode::Morph {
            self.morph_cycles(&request, &root_id)
        } else {
            Vec::new()
        };

        let _lease = if self.config.production {
            Some(self.registry.lease_production(&request.agent)?)
        } else {
            None
        };
        let space = self.registry.snapshot(&request.agent)?;

        let run = Run {
            coordinator: self,
            tree: Mutex::new(tree),
            in_flight: Mutex::new(HashSet::new()),
        };
        let status = run.run_task(&root_id, space, definition.recursive, request.cancel)?;
        let tree = run
            .tree
            .into_inner()
            .map_err(|_| anyhow!("task tree lock poisoned"))?;

        let violations = validate_tree(&tree);
        if !violations.is_empty() {
            bail!("task tree invariants violated: {}", violations.join("; "));
        }
        info!(task = %root_id, %status, "run finished");
        self.report(tree, morph)
    }

    /// Morph until a cycle adds nothing or the cycle budget is spent.
    fn morph_cycles(&self, request: &RunRequest, root: &TaskId) -> Vec<MorphReport> {
        if !self.morph.allowed(request.auto_morph) {
            warn!("morphing is disabled in production for this task; using the registered actions");
            return Vec::new();
        }
        let mut reports = Vec::new();
        for cycle in 1..=self.config.morph.max_cycles {
            let morph_request = MorphRequest {
                agent: request.agent.clone(),
                goal: request.goal.clone(),
                input: request.input.clone(),
                auto_morph: request.auto_morph,
                lineage: root.clone(),
                source: root.clone(),
                cycle,
            };
            match self
                .morph
                .morph(&self.engine, &morph_request, self.memory.as_ref())
            {
                Ok(report) => {
                    let committed = report.committed;
                    reports.push(report);
                    if !committed {
                        break;
                    }
                }
                Err(err) => {
                    warn!(cycle, err = %format!("{err:#}"), "morph cycle failed; using the registered actions");
                    break;
                }
            }
        }
        reports
    }

    fn report(&self, tree: TaskTree, morph: Vec<MorphReport>) -> Result<TaskReport> {
        let root = tree.root()?.clone();
        let subtree: HashSet<TaskId> = tree.subtree(&root.id)?.into_iter().collect();
        let evidence = self
            .memory
            .lineage(&root.lineage)
            .with_context(|| format!("read memory for {}", root.lineage))?
            .into_iter()
            .filter(|record| subtree.contains(&record.source))
            .collect();
        Ok(TaskReport {
            task_id: root.id,
            lineage: root.lineage,
            goal: root.goal,
            status: root.status,
            output: root.output,
            error: root.error,
            states: root.states,
            evidence,
            morph,
            tree,
        })
    }
}

enum Flow {
    Continue,
    Done(TaskStatus),
}

/// State of one run, shared by every task thread in it.
struct Run<'a> {
    coordinator: &'a RunCoordinator,
    tree: Mutex<TaskTree>,
    in_flight: Mutex<HashSet<TaskId>>,
}

/// Marks a task as being driven; a second driver for the same task is refused.
struct InFlight<'r> {
    set: &'r Mutex<HashSet<TaskId>>,
    id: TaskId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

impl Run<'_> {
    fn tree(&self) -> Result<MutexGuard<'_, TaskTree>> {
        self.tree
            .lock()
            .map_err(|_| anyhow!("task tree lock poisoned"))
    }

    fn task(&self, id: &TaskId) -> Result<Task> {
        Ok(self.tree()?.get(id)?.clone())
    }

    fn transition(&self, id: &TaskId, state: RunState) -> Result<()> {
        self.tree()?.push_state(id, state)
    }

    fn enter(&self, id: &TaskId) -> Result<InFlight<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("in-flight lock poisoned"))?;
        if !set.insert(id.clone()) {
            bail!("task {id} is already being decided");
        }
        Ok(InFlight {
            set: &self.in_flight,
            id: id.clone(),
        })
    }

    #[instrument(skip_all, fields(task = %id))]
    fn run_task(
        &self,
        id: &TaskId,
        space: Arc<ActionSpace>,
        recursive: bool,
        cancel: CancelToken,
    ) -> Result<TaskStatus> {
        let _guard = self.enter(id)?;
        let coordinator = self.coordinator;
        let task = self.task(id)?;
        let ctx = RunContext {
            agent: task.agent,
            space,
            memory: Arc::clone(&coordinator.memory),
            mode: coordinator.config.mode,
            lineage: task.lineage,
            dry_run: false,
            recursive,
            cancel,
        };

        let max_steps = coordinator.config.engine.max_steps_per_task;
        let mut learn_retries = 0;
        for step in 1..=max_steps {
            self.begin_deciding(id)?;
            if ctx.cancel.is_cancelled() {
                return self.fail_terminal(
                    id,
                    &ctx,
                    ErrorKind::Cancelled,
                    json!({"detail": "cancelled before deciding"}),
                );
            }

            let task = self.task(id)?;
            let decision = match coordinator.engine.decide(&task, &ctx) {
                Ok(decision) => decision,
                Err(err) => {
                    let Some(kind) = core_kind(&err) else {
                        return Err(err.context(format!("decide task {id}")));
                    };
                    let detail = json!({"detail": format!("{err:#}")});
                    match self.on_failure(id, &ctx, Some(kind), detail, None, &mut learn_retries)? {
                        Flow::Continue => continue,
                        Flow::Done(status) => return Ok(status),
                    }
                }
            };
            self.transition(id, RunState::Dispatching)?;

            let flow = if decision.kind == DecisionKind::Decompose {
                self.expand(&task, &decision, &ctx, &mut learn_retries)?
            } else {
                self.dispatch(&task, &decision, &ctx, &mut learn_retries)?
            };
            if let Flow::Done(status) = flow {
                return Ok(status);
            }
            info!(step, "task continues");
        }

        warn!(max_steps, "step budget exhausted");
        self.transition(id, RunState::CannotComplete)?;
        let detail = json!({"detail": format!("no result after {max_steps} steps")});
        self.remember_failure(id, &ctx, detail.clone())?;
        self.settle(id, TaskStatus::CannotComplete, Some(detail), None)
    }

    fn begin_deciding(&self, id: &TaskId) -> Result<()> {
        let mut tree = self.tree()?;
        tree.push_state(id, RunState::Deciding)?;
        if tree.get(id)?.status == TaskStatus::Pending {
            tree.set_status(id, TaskStatus::InProgress)?;
        }
        Ok(())
    }

    fn dispatch(
        &self,
        task: &Task,
        decision: &Decision,
        ctx: &RunContext,
        learn_retries: &mut u32,
    ) -> Result<Flow> {
        let outcome = self
            .coordinator
            .dispatcher
            .dispatch(task, decision, ctx, self)?;

        if decision.kind == DecisionKind::CannotComplete {
            info!(reason = %decision.reason, "task cannot complete");
            let status = self.finish(
                &task.id,
                RunState::CannotComplete,
                Some(outcome.payload),
                None,
            )?;
            return Ok(Flow::Done(status));
        }

        if outcome.is_success() {
            if decision.completes_task {
                let status =
                    self.finish(&task.id, RunState::Completed, Some(outcome.payload), None)?;
                return Ok(Flow::Done(status));
            }
            self.tree()?.set_output(&task.id, outcome.payload)?;
            return Ok(Flow::Continue);
        }

        let invocation = decision.action.as_ref().map(|action| (action, &decision.input));
        self.on_failure(
            &task.id,
            ctx,
            outcome.error_kind,
            outcome.payload,
            invocation,
            learn_retries,
        )
    }

    /// Validate a decomposition, run its children group by group and fold
    /// their results into the parent.
    fn expand(
        &self,
        task: &Task,
        decision: &Decision,
        ctx: &RunContext,
        learn_retries: &mut u32,
    ) -> Result<Flow> {
        let id = &task.id;
        let path = self.tree()?.path(id)?;
        let plan = match decompose(
            id,
            &path,
            &decision.sub_tasks,
            &self.coordinator.config.decompose_limits(),
        ) {
            Ok(plan) => plan,
            Err(violation) => {
                warn!(err = %violation, "decomposition rejected");
                let detail = json!({"detail": violation.to_string()});
                return self.on_failure(id, ctx, Some(violation.kind()), detail, None, learn_retries);
            }
        };

        self.transition(id, RunState::Decomposing)?;
        let groups = {
            let mut tree = self.tree()?;
            tree.set_status(id, TaskStatus::Decomposed)?;
            tree.begin_wave(id)?;
            let mut groups = Vec::with_capacity(plan.groups.len());
            for group in &plan.groups {
                let mut ids = Vec::with_capacity(group.len());
                for spec in group {
                    ids.push(tree.add_child(
                        id,
                        &task.agent,
                        &spec.goal,
                        json!({}),
                        TaskOrigin::Subtask {
                            group: spec.group,
                            optional: spec.optional,
                        },
                    )?);
                }
                groups.push(ids);
            }
            tree.push_state(id, RunState::AwaitingChildren)?;
            groups
        };
        info!(children = plan.len(), groups = groups.len(), "decomposed");

        let mut finished: Vec<ChildSummary> = Vec::new();
        let mut blocked = false;
        for group in &groups {
            if blocked || ctx.cancel.is_cancelled() {
                for child in group {
                    self.skip(child, ctx)?;
                    finished.push(ChildSummary::from_task(&self.task(child)?));
                }
                continue;
            }
            if !finished.is_empty() {
                let input = json!({"prior_outputs": prior_outputs(&finished)});
                let mut tree = self.tree()?;
                for child in group {
                    tree.set_input(child, input.clone())?;
                }
            }
            self.run_group(group, ctx)?;
            for child in group {
                finished.push(ChildSummary::from_task(&self.task(child)?));
            }
            blocked = !required_failures(&finished).is_empty();
        }

        let failures = required_failures(&finished);
        if failures.is_empty() {
            let status = self.finish(id, RunState::Completed, Some(aggregate(&finished)), None)?;
            return Ok(Flow::Done(status));
        }
        let detail = json!({
            "detail": "required sub-tasks did not succeed",
            "children": failures
                .iter()
                .map(|child| json!({"id": child.id, "goal": child.goal, "status": child.status}))
                .collect::<Vec<_>>(),
        });
        self.on_failure(id, ctx, None, detail, None, learn_retries)
    }

    /// Run one execution group. A required child that does not succeed
    /// cancels its still-running siblings.
    fn run_group(&self, group: &[TaskId], ctx: &RunContext) -> Result<()> {
        let group_cancel = ctx.cancel.child();
        if let [only] = group {
            return self.run_child(only, ctx, &group_cancel);
        }
        thread::scope(|scope| {
            let handles: Vec<_> = group
                .iter()
                .map(|child| {
                    let token = group_cancel.clone();
                    scope.spawn(move || self.run_child(child, ctx, &token))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| -> Result<()> {
                    handle
                        .join()
                        .map_err(|_| anyhow!("sub-task thread panicked"))?
                })
                .collect::<Result<Vec<()>>>()
        })?;
        Ok(())
    }

    fn run_child(&self, child: &TaskId, ctx: &RunContext, group: &CancelToken) -> Result<()> {
        let status = self.run_task(child, Arc::clone(&ctx.space), ctx.recursive, group.child())?;
        if status != TaskStatus::Succeeded && !self.task(child)?.is_optional() {
            warn!(%child, %status, "required sub-task did not succeed; cancelling siblings");
            group.cancel();
        }
        Ok(())
    }

    /// Close a child that never ran because an earlier group failed.
    fn skip(&self, child: &TaskId, ctx: &RunContext) -> Result<()> {
        let detail = json!({"detail": "skipped after a required sibling failed"});
        self.remember_failure(child, ctx, detail.clone())?;
        let mut tree = self.tree()?;
        tree.set_status(child, TaskStatus::InProgress)?;
        tree.set_status(child, TaskStatus::CannotComplete)?;
        tree.set_output(child, detail)
    }

    /// Record a failure and pick the next step: the learn path re-enters
    /// `Deciding` with the failure in memory, everything else ends the task.
    fn on_failure(
        &self,
        id: &TaskId,
        ctx: &RunContext,
        kind: Option<ErrorKind>,
        detail: Value,
        invocation: Option<(&ActionRef, &Value)>,
        learn_retries: &mut u32,
    ) -> Result<Flow> {
        self.transition(id, RunState::Failed)?;
        self.remember_failure(
            id,
            ctx,
            json!({
                "error_kind": kind,
                "detail": detail,
                "action": invocation.map(|(action, _)| action),
                "input": invocation.map(|(_, input)| input),
            }),
        )?;

        let learn = &self.coordinator.config.learn;
        if !kind.is_none_or(ErrorKind::is_retryable) || !learn.enabled {
            warn!(error = ?kind, "task failed");
            return Ok(Flow::Done(self.settle(id, TaskStatus::Failed, Some(detail), kind)?));
        }
        if *learn_retries < learn.max_retries {
            *learn_retries += 1;
            info!(retry = *learn_retries, error = ?kind, "re-deciding after failure");
            return Ok(Flow::Continue);
        }
        warn!(error = ?kind, "learning retries exhausted");
        self.transition(id, RunState::CannotComplete)?;
        Ok(Flow::Done(self.settle(
            id,
            TaskStatus::CannotComplete,
            Some(detail),
            kind,
        )?))
    }

    /// Record a failure that is never retried.
    fn fail_terminal(
        &self,
        id: &TaskId,
        ctx: &RunContext,
        kind: ErrorKind,
        detail: Value,
    ) -> Result<TaskStatus> {
        self.transition(id, RunState::Failed)?;
        self.remember_failure(id, ctx, json!({"error_kind": kind, "detail": detail}))?;
        self.settle(id, TaskStatus::Failed, Some(detail), Some(kind))
    }

    fn remember_failure(&self, id: &TaskId, ctx: &RunContext, payload: Value) -> Result<()> {
        ctx.memory
            .append(NewRecord::new(
                &ctx.lineage,
                id,
                MemoryKind::FailureReason,
                payload,
            ))
            .with_context(|| format!("record failure of {id}"))?;
        Ok(())
    }

    fn finish(
        &self,
        id: &TaskId,
        state: RunState,
        output: Option<Value>,
        error: Option<ErrorKind>,
    ) -> Result<TaskStatus> {
        let status = state
            .final_status()
            .ok_or_else(|| anyhow!("{state} is not a final state"))?;
        self.transition(id, state)?;
        self.settle(id, status, output, error)
    }

    fn settle(
        &self,
        id: &TaskId,
        status: TaskStatus,
        output: Option<Value>,
        error: Option<ErrorKind>,
    ) -> Result<TaskStatus> {
        let mut tree = self.tree()?;
        tree.set_status(id, status)?;
        if let Some(output) = output {
            tree.set_output(id, output)?;
        }
        tree.set_error(id, error)?;
        info!(task = %id, %status, "task finished");
        Ok(status)
    }
}

impl DelegateRunner for Run<'_> {
    fn run_delegate(&self, parent: &Task, request: DelegateRequest) -> Result<DelegateResult> {
        let coordinator = self.coordinator;
        let path = self.tree()?.path(&parent.id)?;
        check_delegation(
            &parent.id,
            &path,
            &request.agent,
            &request.goal,
            coordinator.config.decompose.max_depth,
        )?;

        let unavailable = |_| CoreError::ActionUnavailable {
            action: request.action.to_string(),
        };
        let definition = coordinator
            .registry
            .definition(&request.agent)
            .map_err(unavailable)?;
        let _lease = if coordinator.config.production {
            Some(
                coordinator
                    .registry
                    .lease_production(&request.agent)
                    .map_err(|err| CoreError::ExternalFailure(err.to_string()))?,
            )
        } else {
            None
        };
        let space = coordinator
            .registry
            .snapshot(&request.agent)
            .map_err(unavailable)?;

        let origin = TaskOrigin::Delegation {
            action: request.action.to_string(),
            attempt: request.attempt,
        };
        let child = {
            let mut tree = self.tree()?;
            if tree.get(&parent.id)?.state() == RunState::Dispatching {
                tree.push_state(&parent.id, RunState::Decomposing)?;
                tree.set_status(&parent.id, TaskStatus::Decomposed)?;
                tree.begin_wave(&parent.id)?;
                let child = tree.add_child(
                    &parent.id,
                    &request.agent,
                    &request.goal,
                    request.input.clone(),
                    origin,
                )?;
                tree.push_state(&parent.id, RunState::AwaitingChildren)?;
                child
            } else {
                tree.add_child(
                    &parent.id,
                    &request.agent,
                    &request.goal,
                    request.input.clone(),
                    origin,
                )?
            }
        };
        info!(parent = %parent.id, %child, agent = %request.agent, attempt = request.attempt, "delegating");

        let status = self.run_task(&child, space, definition.recursive, request.cancel)?;
        let finished = self.task(&child)?;
        Ok(DelegateResult {
            task_id: child,
            status,
            output: finished.output.unwrap_or(Value::Null),
            error: finished.error,
        })
    }
}
