//! Shared test utilities for jobflow integration tests.
//!
//! This module provides:
//! - Scripted `Stage` implementations with controllable behavior
//! - Builders for pipelines and configurations
//! - `TestHarness` wiring an orchestrator with an event recorder

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
