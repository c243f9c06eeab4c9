//! Deterministic, pure logic shared by the decision-and-dispatch core.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod action_space;
pub mod aggregate;
pub mod candidate;
pub mod decomposer;
pub mod invariants;
pub mod retry;
pub mod schema;
pub mod scope;
pub mod state_machine;
pub mod types;
