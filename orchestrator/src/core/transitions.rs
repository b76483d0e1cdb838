//! State machine tables for items, runs, and tasks.
//!
//! Every status write in the store goes through these checks, so a transition
//! that is not listed here can never be persisted.

use super::types::{ItemStatus, RunStatus, TaskStatus};

/// `approved -> in_progress -> {completed, failed}`; `new`/`failed` may be
/// (re-)approved by the operator.
pub fn item_transition_allowed(from: ItemStatus, to: ItemStatus) -> bool {
    use ItemStatus::{Approved, Completed, Failed, InProgress, New};
    matches!(
        (from, to),
        (New, Approved)
            | (Failed, Approved)
            | (Approved, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
    )
}

/// `pending -> running -> {completed, failed, cancelled}`, with no shortcut
/// from `pending` to a terminal state.
pub fn run_transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::{Cancelled, Completed, Failed, Pending, Running};
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

/// `pending -> running -> {completed, failed, skipped}`.
pub fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::{Completed, Failed, Pending, Running, Skipped};
    matches!(
        (from, to),
        (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Skipped)
    )
}
