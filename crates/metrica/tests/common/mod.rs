//! Shared test utilities for metrica integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs with a temp database and artifact store
//! - A scripted recognition engine and builders for its results

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{test_config, transient_failure, ScriptedEngine, TestHarness};
