//! Morph controller: discover the action space a task needs.
//!
//! A cycle dry-runs the task against an exploratory space with scratch
//! memory, collects the capabilities the engine asked for, resolves them in
//! the catalog and commits the additions under the registry's single-writer
//! lock. Nothing observed during the dry run is dispatched.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::context::{CancelToken, RunContext};
use crate::core::action_space::{ActionSpace, ActionSpaceDiff};
use crate::core::decomposer::{DecomposeLimits, decompose};
use crate::core::types::{
    ActionKind, ActionRef, CapabilityHint, DecisionKind, MemoryKind, Mode, TaskId,
};
use crate::engine::DecisionEngine;
use crate::io::approval::Approver;
use crate::io::catalog::{Catalog, CatalogError};
use crate::io::memory_store::{InMemoryStore, MemoryStore, NewRecord};
use crate::io::registry::{ActionRegistry, RegistryError};
use crate::tree::{TaskOrigin, TaskTree};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MorphError {
    #[error("morphing '{agent}' is disabled in production unless the task is auto-morph")]
    Gated { agent: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// What the task to morph for looks like.
#[derive(Debug, Clone)]
pub struct MorphRequest {
    pub agent: String,
    pub goal: String,
    pub input: Value,
    pub auto_morph: bool,
    /// Lineage and source the learned fact is recorded under.
    pub lineage: TaskId,
    pub source: TaskId,
    /// 1-based cycle number; the first cycle explores an empty space.
    pub cycle: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MorphReport {
    pub agent: String,
    pub cycle: u32,
    pub wanted: Vec<CapabilityHint>,
    pub unresolved: Vec<CapabilityHint>,
    pub added: Vec<ActionRef>,
    pub committed: bool,
    /// Registry version after the cycle.
    pub version: u64,
    #[serde(skip)]
    pub diff: ActionSpaceDiff,
}

pub struct MorphController {
    registry: Arc<ActionRegistry>,
    catalog: Arc<Catalog>,
    approver: Arc<dyn Approver>,
    production: bool,
    limits: DecomposeLimits,
}

impl MorphController {
    pub fn new(
        registry: Arc<ActionRegistry>,
        catalog: Arc<Catalog>,
        approver: Arc<dyn Approver>,
        production: bool,
        limits: DecomposeLimits,
    ) -> Self {
        Self {
            registry,
            catalog,
            approver,
            production,
            limits,
        }
    }

    /// Whether a task may morph at all.
    pub fn allowed(&self, auto_morph: bool) -> bool {
        !self.production || auto_morph
    }

    /// Run one morph cycle.
    #[instrument(skip_all, fields(agent = %request.agent, cycle = request.cycle))]
    pub fn morph(
        &self,
        engine: &DecisionEngine,
        request: &MorphRequest,
        memory: &dyn MemoryStore,
    ) -> Result<MorphReport> {
        if !self.allowed(request.auto_morph) {
            return Err(MorphError::Gated {
                agent: request.agent.clone(),
            }
            .into());
        }

        let mut lock = self
            .registry
            .begin_morph(&request.agent)
            .map_err(MorphError::from)?;
        let current = lock.current().map_err(MorphError::from)?;
        let definition = self
            .registry
            .definition(&request.agent)
            .map_err(MorphError::from)?;

        let exploratory = if request.cycle <= 1 {
            Arc::new(ActionSpace::empty())
        } else {
            Arc::clone(&current)
        };
        let wanted = self
            .dry_run(engine, request, exploratory, definition.recursive)
            .context("morph dry run")?;

        let mut added = Vec::new();
        let mut unresolved = Vec::new();
        for hint in &wanted {
            match self.catalog.resolve(hint).map_err(MorphError::from)? {
                Some(action) if current.get(action.name()).is_none() => added.push(action),
                Some(_) => {}
                None => unresolved.push(hint.clone()),
            }
        }
        if !unresolved.is_empty() {
            warn!(
                unresolved = ?unresolved.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "wanted capabilities are not catalogued"
            );
        }

        let target = ActionSpace::new(current.version(), current.actions().cloned().chain(added));
        let diff = current.diff(&target);
        let mut report = MorphReport {
            agent: request.agent.clone(),
            cycle: request.cycle,
            wanted,
            unresolved,
            added: diff.added_refs(),
            committed: false,
            version: current.version(),
            diff: diff.clone(),
        };
        if diff.is_empty() {
            info!("dry run wants nothing new");
            return Ok(report);
        }
        if !self.approver.approve_diff(&request.agent, &diff) {
            info!(added = diff.len(), "action space diff was not approved");
            return Ok(report);
        }

        let next = lock.commit(&diff).map_err(MorphError::from)?;
        drop(lock);
        report.committed = true;
        report.version = next.version();

        memory
            .append(NewRecord::new(
                &request.lineage,
                &request.source,
                MemoryKind::LearnedFact,
                json!({
                    "key": format!("action-space:{}", request.agent),
                    "value": {
                        "version": next.version(),
                        "added": report.added,
                        "unresolved": report.unresolved,
                    },
                }),
            ))
            .context("record learned action space")?;
        info!(version = next.version(), added = report.added.len(), "morph committed");
        Ok(report)
    }

    /// Decide the task and one level of its proposed sub-tasks with scratch
    /// memory, returning every wanted capability once.
    fn dry_run(
        &self,
        engine: &DecisionEngine,
        request: &MorphRequest,
        space: Arc<ActionSpace>,
        recursive: bool,
    ) -> Result<Vec<CapabilityHint>> {
        let mut tree = TaskTree::new_root(
            &request.agent,
            &request.goal,
            request.input.clone(),
            request.auto_morph,
        );
        let root_id = tree.root_id().clone();
        let ctx = RunContext {
            agent: request.agent.clone(),
            space,
            memory: Arc::new(InMemoryStore::new()),
            mode: Mode::Morph,
            lineage: root_id.clone(),
            dry_run: true,
            recursive,
            cancel: CancelToken::new(),
        };

        let mut wanted: BTreeMap<(ActionKind, String), CapabilityHint> = BTreeMap::new();
        let mut collect = |hints: Vec<CapabilityHint>| {
            for hint in hints {
                wanted.entry((hint.kind, hint.name.clone())).or_insert(hint);
            }
        };

        let decision = engine.decide(tree.root()?, &ctx)?;
        collect(decision.wanted.clone());

        if decision.kind == DecisionKind::Decompose {
            let path = tree.path(&root_id)?;
            match decompose(&root_id, &path, &decision.sub_tasks, &self.limits) {
                Ok(plan) => {
                    for spec in plan.groups.iter().flatten() {
                        let child = tree.add_child(
                            &root_id,
                            &request.agent,
                            &spec.goal,
                            json!({}),
                            TaskOrigin::Subtask {
                                group: spec.group,
                                optional: spec.optional,
                            },
                        )?;
                        match engine.decide(tree.get(&child)?, &ctx) {
                            Ok(sub) => collect(sub.wanted),
                            Err(err) => warn!(child = %child, err = %format!("{err:#}"), "sub-task dry run failed"),
                        }
                    }
                }
                Err(err) => warn!(err = %err, "dry-run decomposition rejected"),
            }
        }

        Ok(wanted.into_values().collect())
    }
}
