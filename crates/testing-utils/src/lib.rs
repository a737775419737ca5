//! # Taskgate Testing Utils
//!
//! Shared testing utilities for the queue workspace: in-memory repositories,
//! scripted executors, filesystem/network doubles, builders and config presets.
//!
//! ```rust,ignore
//! use taskgate_testing_utils::{InMemoryStore, ScriptedExecutor, test_config};
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
