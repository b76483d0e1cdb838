//! Reconcile a recomputed plan against persisted task rows.

use std::collections::BTreeSet;

use super::types::{ExecutionTask, PlannedTask, TaskStatus, WaveCounts};

/// Difference between the plan and what the store already holds for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Planned tasks with no row yet.
    pub missing: Vec<PlannedTask>,
    /// `(wave, task_number)` of rows the current plan no longer produces.
    pub unplanned: Vec<(u32, u32)>,
}

impl Reconciliation {
    pub fn is_in_sync(&self) -> bool {
        self.missing.is_empty() && self.unplanned.is_empty()
    }
}

pub fn reconcile(planned: &[PlannedTask], rows: &[ExecutionTask]) -> Reconciliation {
    let persisted: BTreeSet<(u32, u32)> = rows.iter().map(|r| (r.wave, r.task_number)).collect();
    let wanted: BTreeSet<(u32, u32)> = planned.iter().map(|t| (t.wave, t.task_number)).collect();
    Reconciliation {
        missing: planned
            .iter()
            .filter(|t| !persisted.contains(&(t.wave, t.task_number)))
            .cloned()
            .collect(),
        unplanned: persisted.difference(&wanted).copied().collect(),
    }
}

/// Tasks of `wave` that still need an executor call.
///
/// `running` rows are included: they were in flight when a previous invocation
/// died and their outcome was never recorded.
pub fn dispatchable(rows: &[ExecutionTask], wave: u32) -> Vec<ExecutionTask> {
    let mut tasks: Vec<ExecutionTask> = rows
        .iter()
        .filter(|r| r.wave == wave && !r.status.is_terminal())
        .cloned()
        .collect();
    tasks.sort_by_key(|t| t.task_number);
    tasks
}

pub fn wave_counts(rows: &[ExecutionTask], wave: u32) -> WaveCounts {
    let mut counts = WaveCounts::default();
    for row in rows.iter().filter(|r| r.wave == wave) {
        counts.record(row.status);
    }
    counts
}

/// True if any task of the run has failed.
pub fn any_failed(rows: &[ExecutionTask]) -> bool {
    rows.iter().any(|r| r.status == TaskStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SubagentType;

    fn planned(wave: u32, task_number: u32) -> PlannedTask {
        PlannedTask {
            wave,
            task_number,
            subagent_type: SubagentType::GeneralPurpose,
            description: format!("task {wave}.{task_number}"),
        }
    }

    fn row(wave: u32, task_number: u32, status: TaskStatus) -> ExecutionTask {
        ExecutionTask {
            id: format!("t-{wave}-{task_number}"),
            run_id: "run".to_string(),
            wave,
            task_number,
            subagent_type: SubagentType::GeneralPurpose,
            description: String::new(),
            status,
            output: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn reports_missing_and_unplanned_rows() {
        let plan = vec![planned(1, 1), planned(1, 2), planned(2, 1)];
        let rows = vec![row(1, 1, TaskStatus::Completed), row(3, 1, TaskStatus::Pending)];
        let result = reconcile(&plan, &rows);
        let missing: Vec<(u32, u32)> = result
            .missing
            .iter()
            .map(|t| (t.wave, t.task_number))
            .collect();
        assert_eq!(missing, vec![(1, 2), (2, 1)]);
        assert_eq!(result.unplanned, vec![(3, 1)]);
        assert!(!result.is_in_sync());
    }

    #[test]
    fn dispatch_skips_terminal_tasks_and_keeps_in_flight_ones() {
        let rows = vec![
            row(1, 3, TaskStatus::Pending),
            row(1, 1, TaskStatus::Completed),
            row(1, 2, TaskStatus::Running),
            row(2, 1, TaskStatus::Pending),
        ];
        let numbers: Vec<u32> = dispatchable(&rows, 1).iter().map(|t| t.task_number).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn counts_are_per_wave() {
        let rows = vec![
            row(1, 1, TaskStatus::Completed),
            row(1, 2, TaskStatus::Failed),
            row(2, 1, TaskStatus::Pending),
        ];
        let counts = wave_counts(&rows, 1);
        assert_eq!(counts.terminal(), 2);
        assert_eq!(counts.pending, 0);
        assert!(any_failed(&rows));
    }
}
