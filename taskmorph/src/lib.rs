//! Decision-and-dispatch core of a self-extending task agent.
//!
//! A task is decided one step at a time: the [`engine`] turns untrusted
//! provider proposals into validated decisions over a fixed action space
//! snapshot, the [`dispatcher`] executes the chosen action and records every
//! attempt, and the [`coordinator`] drives each task through its state
//! machine, fanning out into sub-tasks and delegated tasks. In morph mode the
//! [`morph`] controller first grows the agent's action space from a catalog.
//!
//! - **[`core`]**: Pure logic (candidate parsing, decomposition checks, state
//!   transitions, aggregation). No I/O.
//! - **[`io`]**: Registry, catalog, memory stores, config, prompts and
//!   external processes.

pub mod context;
pub mod coordinator;
pub mod core;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod io;
pub mod logging;
pub mod morph;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tree;
