//! Side-effecting layers: git, the SQLite store, the lock file, and task
//! execution.

pub mod branches;
pub mod config;
pub mod executor;
pub mod git;
pub mod git_state;
pub mod init;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod signals;
pub mod store;
