//! Catalog of action implementations available to morphing.
//!
//! The registry holds what an agent *may use*; the catalog holds everything
//! an operator has made available at all. Morph cycles resolve wanted
//! capabilities here and never invent an action that is not catalogued.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::action_space::Action;
use crate::core::types::{ActionKind, CapabilityHint};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog is finalized, cannot add '{0}'")]
    Finalized(String),

    #[error("catalog is already finalized")]
    AlreadyFinalized,

    #[error("catalog is not finalized")]
    NotFinalized,

    #[error("action '{0}' is already catalogued")]
    Duplicate(String),
}

#[derive(Debug, Default)]
pub struct Catalog {
    finalized: bool,
    actions: BTreeMap<String, Action>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: Action) -> Result<(), CatalogError> {
        if self.finalized {
            return Err(CatalogError::Finalized(action.name().to_string()));
        }
        if self.actions.contains_key(action.name()) {
            return Err(CatalogError::Duplicate(action.name().to_string()));
        }
        self.actions.insert(action.name().to_string(), action);
        Ok(())
    }

    /// Freeze the catalog; it can be resolved against only afterwards.
    pub fn finalize(&mut self) -> Result<(), CatalogError> {
        if self.finalized {
            return Err(CatalogError::AlreadyFinalized);
        }
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The catalogued action matching a hint's name and kind, if any.
    pub fn resolve(&self, hint: &CapabilityHint) -> Result<Option<Action>, CatalogError> {
        if !self.finalized {
            return Err(CatalogError::NotFinalized);
        }
        Ok(self
            .actions
            .get(&hint.name)
            .filter(|action| action.spec.kind() == hint.kind)
            .cloned())
    }

    /// Catalogued delegates, by the agent definition they target.
    pub fn delegates(&self) -> impl Iterator<Item = &Action> {
        self.actions
            .values()
            .filter(|action| action.spec.kind() == ActionKind::Delegate)
    }
}
