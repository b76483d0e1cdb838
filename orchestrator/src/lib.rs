//! Mason execution orchestrator.
//!
//! Turns approved backlog items into branch-per-item changes: each item is
//! planned into waves of tasks, the waves run against the live working tree
//! under a repository lock, and every state transition is persisted so an
//! interrupted invocation can be resumed. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (planning, selection, state
//!   machines, branch naming). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (git, SQLite store, lock file,
//!   task executors). Isolated to enable test doubles.
//!
//! Orchestration modules ([`execute`], [`dispatch`], [`items`], [`status`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod dispatch;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod items;
pub mod logging;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
