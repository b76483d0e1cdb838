//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod branch_name;
pub mod planner;
pub mod reconcile;
pub mod selection;
pub mod transitions;
pub mod types;
