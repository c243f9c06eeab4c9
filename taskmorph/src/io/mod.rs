//! Side-effecting collaborators: configuration, persistence, registry,
//! tools, providers and approval.

pub mod approval;
pub mod catalog;
pub mod config;
pub mod memory_store;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod tools;
