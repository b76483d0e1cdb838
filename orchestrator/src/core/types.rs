//! Shared domain types for the orchestrator core.
//!
//! These types define stable contracts between the planner, the store, and the
//! driver. They carry no I/O and their string forms are persisted in the store,
//! so renaming a variant is a schema change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a persisted status or tag string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle of a backlog item as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    New,
    Approved,
    InProgress,
    Completed,
    Failed,
}

string_enum!(ItemStatus, "item status", {
    New => "new",
    Approved => "approved",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

/// Lifecycle of an execution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Reserved for an interactive interrupt path; the driver never sets it.
    Cancelled,
}

string_enum!(RunStatus, "run status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Lifecycle of a single task inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

string_enum!(TaskStatus, "task status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// Routing tag telling the task executor which capability performs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubagentType {
    Explore,
    Plan,
    GeneralPurpose,
    TestWriter,
    CodeReviewer,
}

string_enum!(SubagentType, "subagent type", {
    Explore => "explore",
    Plan => "plan",
    GeneralPurpose => "general-purpose",
    TestWriter => "test-writer",
    CodeReviewer => "code-reviewer",
});

/// What to do with the rest of a run once a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Skip the unstarted tasks of the failing wave and fail the run.
    #[default]
    Stop,
    /// Let every wave run; the run still ends failed.
    Continue,
}

/// An AI-analyzed improvement item. Problem and solution text are opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogItem {
    pub id: String,
    pub title: String,
    pub problem: String,
    pub solution: String,
    pub item_type: String,
    pub priority: i64,
    pub complexity: u8,
    pub status: ItemStatus,
    pub branch_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Persisted execution run, one per claimed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRun {
    pub id: String,
    pub item_ids: Vec<String>,
    pub status: RunStatus,
    pub current_wave: u32,
    pub total_waves: u32,
    pub branch_name: String,
    pub backup_branch: String,
    pub original_head: String,
    /// Branch checked out before the invocation that created this run.
    pub original_branch: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

/// Persisted task row belonging to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionTask {
    pub id: String,
    pub run_id: String,
    pub wave: u32,
    pub task_number: u32,
    pub subagent_type: SubagentType,
    pub description: String,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// A task as produced by the planner, before it has a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTask {
    pub wave: u32,
    pub task_number: u32,
    pub subagent_type: SubagentType,
    pub description: String,
}

/// A barrier-synchronized group of tasks (1-indexed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wave {
    pub number: u32,
    pub tasks: Vec<PlannedTask>,
}

/// Per-wave task counts, used for progress reporting and invariant checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveCounts {
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl WaveCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn terminal(&self) -> u32 {
        self.completed + self.failed + self.skipped
    }

    pub fn total(&self) -> u32 {
        self.pending + self.running + self.terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in ItemStatus::ALL {
            assert_eq!(status.as_str().parse::<ItemStatus>(), Ok(*status));
        }
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(*status));
        }
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(*status));
        }
        for tag in SubagentType::ALL {
            assert_eq!(tag.as_str().parse::<SubagentType>(), Ok(*tag));
        }
    }

    #[test]
    fn unknown_status_reports_kind() {
        let err = "paused".parse::<RunStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown run status 'paused'");
    }

    #[test]
    fn serde_names_match_persisted_strings() {
        let json = serde_json::to_string(&SubagentType::GeneralPurpose).expect("serialize");
        assert_eq!(json, "\"general-purpose\"");
        let json = serde_json::to_string(&ItemStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn wave_counts_track_terminal_states() {
        let mut counts = WaveCounts::default();
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
            TaskStatus::Pending,
        ] {
            counts.record(status);
        }
        assert_eq!(counts.terminal(), 3);
        assert_eq!(counts.total(), 4);
    }
}
