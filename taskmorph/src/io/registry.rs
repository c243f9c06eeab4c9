//! Versioned action registry with copy-on-write snapshots.
//!
//! Each agent definition owns one `ActionSpace`. Readers take an
//! `Arc<ActionSpace>` snapshot and keep it for as long as they need; a morph
//! commit swaps in a new `Arc` without touching snapshots already handed out.
//!
//! Writes are single-writer per agent definition: a [`MorphLock`] is refused
//! while another morph is active or while a production run holds a
//! [`ProductionLease`], and leases are refused while a morph is active.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::core::action_space::{Action, ActionSpace, ActionSpaceDiff};
use crate::core::types::ActionRef;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown agent definition '{0}'")]
    UnknownAgent(String),

    #[error("agent definition '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("action '{action}' already exists for agent '{agent}'")]
    DuplicateAction { agent: String, action: String },

    #[error("agent '{0}' is being morphed")]
    MorphInProgress(String),

    #[error("agent '{agent}' has {leases} production run(s) in flight")]
    ProductionActive { agent: String, leases: usize },

    #[error("agent '{agent}' moved from version {expected} to {found} during the morph")]
    VersionConflict {
        agent: String,
        expected: u64,
        found: u64,
    },

    #[error("morph commits may not remove actions ({0})")]
    SilentRemoval(String),

    #[error("registry lock poisoned")]
    Poisoned,
}

/// Static description of an agent, fixed at definition time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Whether the agent may decompose tasks into sub-tasks.
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_recursive() -> bool {
    true
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            recursive: true,
        }
    }

    pub fn non_recursive(mut self) -> Self {
        self.recursive = false;
        self
    }
}

#[derive(Debug)]
struct AgentEntry {
    definition: AgentDefinition,
    space: Arc<ActionSpace>,
    morphing: bool,
    production_leases: usize,
}

#[derive(Debug, Default)]
pub struct ActionRegistry {
    agents: Mutex<BTreeMap<String, AgentEntry>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, AgentEntry>>, RegistryError> {
        self.agents.lock().map_err(|_| RegistryError::Poisoned)
    }

    /// Register an agent definition with its initial actions (version 1).
    pub fn register_agent(
        &self,
        definition: AgentDefinition,
        actions: Vec<Action>,
    ) -> Result<(), RegistryError> {
        let mut agents = self.lock()?;
        if agents.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateAgent(definition.name));
        }
        let mut names = std::collections::BTreeSet::new();
        for action in &actions {
            if !names.insert(action.name().to_string()) {
                return Err(RegistryError::DuplicateAction {
                    agent: definition.name.clone(),
                    action: action.name().to_string(),
                });
            }
        }
        agents.insert(
            definition.name.clone(),
            AgentEntry {
                definition,
                space: Arc::new(ActionSpace::new(1, actions)),
                morphing: false,
                production_leases: 0,
            },
        );
        Ok(())
    }

    pub fn definition(&self, agent: &str) -> Result<AgentDefinition, RegistryError> {
        let agents = self.lock()?;
        agents
            .get(agent)
            .map(|entry| entry.definition.clone())
            .ok_or_else(|| RegistryError::UnknownAgent(agent.to_string()))
    }

    /// Current action space of `agent`; never changes after it is returned.
    pub fn snapshot(&self, agent: &str) -> Result<Arc<ActionSpace>, RegistryError> {
        let agents = self.lock()?;
        agents
            .get(agent)
            .map(|entry| Arc::clone(&entry.space))
            .ok_or_else(|| RegistryError::UnknownAgent(agent.to_string()))
    }

    pub fn agents(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    /// Take the single-writer lock for `agent`.
    #[instrument(skip(self))]
    pub fn begin_morph(&self, agent: &str) -> Result<MorphLock<'_>, RegistryError> {
        let mut agents = self.lock()?;
        let entry = agents
            .get_mut(agent)
            .ok_or_else(|| RegistryError::UnknownAgent(agent.to_string()))?;
        if entry.morphing {
            return Err(RegistryError::MorphInProgress(agent.to_string()));
        }
        if entry.production_leases > 0 {
            return Err(RegistryError::ProductionActive {
                agent: agent.to_string(),
                leases: entry.production_leases,
            });
        }
        entry.morphing = true;
        Ok(MorphLock {
            registry: self,
            agent: agent.to_string(),
            base_version: entry.space.version(),
        })
    }

    /// Mark a production run against `agent` as in flight.
    pub fn lease_production(&self, agent: &str) -> Result<ProductionLease<'_>, RegistryError> {
        let mut agents = self.lock()?;
        let entry = agents
            .get_mut(agent)
            .ok_or_else(|| RegistryError::UnknownAgent(agent.to_string()))?;
        if entry.morphing {
            return Err(RegistryError::MorphInProgress(agent.to_string()));
        }
        entry.production_leases += 1;
        Ok(ProductionLease {
            registry: self,
            agent: agent.to_string(),
        })
    }
}

/// Exclusive permission to change one agent's action space.
///
/// Dropping the lock releases it, committed or not.
#[derive(Debug)]
pub struct MorphLock<'a> {
    registry: &'a ActionRegistry,
    agent: String,
    base_version: u64,
}

impl MorphLock<'_> {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn current(&self) -> Result<Arc<ActionSpace>, RegistryError> {
        self.registry.snapshot(&self.agent)
    }

    /// Apply an additions-only diff and bump the version.
    #[instrument(skip_all, fields(agent = %self.agent, added = diff.added.len()))]
    pub fn commit(&mut self, diff: &ActionSpaceDiff) -> Result<Arc<ActionSpace>, RegistryError> {
        if !diff.removed.is_empty() {
            let names = diff
                .removed
                .iter()
                .map(ActionRef::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(RegistryError::SilentRemoval(names));
        }

        let mut agents = self.registry.lock()?;
        let entry = agents
            .get_mut(&self.agent)
            .ok_or_else(|| RegistryError::UnknownAgent(self.agent.clone()))?;
        if entry.space.version() != self.base_version {
            return Err(RegistryError::VersionConflict {
                agent: self.agent.clone(),
                expected: self.base_version,
                found: entry.space.version(),
            });
        }
        if let Some(existing) = diff
            .added
            .iter()
            .find(|action| entry.space.get(action.name()).is_some())
        {
            return Err(RegistryError::DuplicateAction {
                agent: self.agent.clone(),
                action: existing.name().to_string(),
            });
        }

        let next = Arc::new(entry.space.apply(diff));
        entry.space = Arc::clone(&next);
        self.base_version = next.version();
        info!(version = next.version(), "committed action space");
        Ok(next)
    }
}

impl Drop for MorphLock<'_> {
    fn drop(&mut self) {
        if let Ok(mut agents) = self.registry.agents.lock()
            && let Some(entry) = agents.get_mut(&self.agent)
        {
            entry.morphing = false;
        }
    }
}

/// A production run in flight; blocks morphs of the agent until dropped.
#[derive(Debug)]
pub struct ProductionLease<'a> {
    registry: &'a ActionRegistry,
    agent: String,
}

impl Drop for ProductionLease<'_> {
    fn drop(&mut self) {
        if let Ok(mut agents) = self.registry.agents.lock()
            && let Some(entry) = agents.get_mut(&self.agent)
        {
            entry.production_leases = entry.production_leases.saturating_sub(1);
        }
    }
}
