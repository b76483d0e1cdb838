use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::debug;

use super::{Store, StoreError, get_enum, now};
use crate::core::transitions::task_transition_allowed;
use crate::core::types::{ExecutionTask, PlannedTask, TaskStatus};

const TASK_COLUMNS: &str = "id, run_id, wave, task_number, subagent_type, description, status, output, error_message, started_at, completed_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionTask> {
    Ok(ExecutionTask {
        id: row.get(0)?,
        run_id: row.get(1)?,
        wave: row.get(2)?,
        task_number: row.get(3)?,
        subagent_type: get_enum(row, 4)?,
        description: row.get(5)?,
        status: get_enum(row, 6)?,
        output: row.get(7)?,
        error_message: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

/// Insert planned tasks that have no row yet. `(run_id, wave, task_number)`
/// is unique, so re-planning a resumed run never duplicates rows.
pub(super) fn insert_missing_tasks_tx(
    tx: &Transaction<'_>,
    run_id: &str,
    tasks: &[PlannedTask],
) -> Result<usize, StoreError> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO execution_tasks(id, run_id, wave, task_number, subagent_type, description, status) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    let mut inserted = 0;
    for task in tasks {
        inserted += stmt.execute(params![
            uuid::Uuid::new_v4().to_string(),
            run_id,
            task.wave,
            task.task_number,
            task.subagent_type.as_str(),
            task.description,
            TaskStatus::Pending.as_str(),
        ])?;
    }
    Ok(inserted)
}

fn task_status_tx(tx: &Transaction<'_>, id: &str) -> Result<TaskStatus, StoreError> {
    let status: Option<TaskStatus> = tx
        .query_row(
            "SELECT status FROM execution_tasks WHERE id = ?1",
            params![id],
            |row| get_enum(row, 0),
        )
        .optional()?;
    status.ok_or_else(|| StoreError::UnknownId {
        kind: "task",
        id: id.to_string(),
    })
}

fn check_task_transition(id: &str, from: TaskStatus, to: TaskStatus) -> Result<(), StoreError> {
    if task_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            kind: "task",
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

impl Store {
    pub fn insert_missing_tasks(
        &mut self,
        run_id: &str,
        tasks: &[PlannedTask],
    ) -> Result<usize, StoreError> {
        self.require_run(run_id)?;
        let tx = self.conn.transaction()?;
        let inserted = insert_missing_tasks_tx(&tx, run_id, tasks)?;
        tx.commit()?;
        if inserted > 0 {
            debug!(run_id, inserted, "inserted missing task rows");
        }
        Ok(inserted)
    }

    /// All tasks of a run in `(wave, task_number)` order.
    pub fn tasks_for_run(&self, run_id: &str) -> Result<Vec<ExecutionTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM execution_tasks WHERE run_id = ?1 \
             ORDER BY wave ASC, task_number ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![run_id], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ExecutionTask>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM execution_tasks WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], task_from_row)
            .optional()?)
    }

    /// Mark a wave's tasks `running` in one transaction.
    ///
    /// Rows left `running` by an interrupted invocation keep their original
    /// `started_at`; anything already terminal is an error.
    pub fn start_tasks(&mut self, ids: &[String]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let ts = now();
        for id in ids {
            let from = task_status_tx(&tx, id)?;
            if from == TaskStatus::Running {
                continue;
            }
            check_task_transition(id, from, TaskStatus::Running)?;
            tx.execute(
                "UPDATE execution_tasks SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![TaskStatus::Running.as_str(), ts, id],
            )?;
        }
        tx.commit()?;
        debug!(count = ids.len(), "tasks marked running");
        Ok(())
    }

    /// Record a task's terminal state with its output or error.
    pub fn finish_task(
        &mut self,
        id: &str,
        to: TaskStatus,
        output: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<ExecutionTask, StoreError> {
        if !to.is_terminal() {
            return Err(StoreError::InvalidInput(format!(
                "finish_task expects a terminal status, got {to}"
            )));
        }
        let tx = self.conn.transaction()?;
        let from = task_status_tx(&tx, id)?;
        check_task_transition(id, from, to)?;
        tx.execute(
            "UPDATE execution_tasks SET status = ?1, output = ?2, error_message = ?3, completed_at = ?4 \
             WHERE id = ?5",
            params![to.as_str(), output, error_message, now(), id],
        )?;
        tx.commit()?;
        debug!(task_id = id, %from, %to, "task finished");
        self.get_task(id)?.ok_or_else(|| StoreError::UnknownId {
            kind: "task",
            id: id.to_string(),
        })
    }

    /// Mark running tasks that were never dispatched as `skipped`.
    pub fn skip_tasks(&mut self, ids: &[String], reason: &str) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let ts = now();
        let mut skipped = 0;
        for id in ids {
            let from = task_status_tx(&tx, id)?;
            check_task_transition(id, from, TaskStatus::Skipped)?;
            skipped += tx.execute(
                "UPDATE execution_tasks SET status = ?1, error_message = ?2, completed_at = ?3 WHERE id = ?4",
                params![TaskStatus::Skipped.as_str(), reason, ts, id],
            )?;
        }
        tx.commit()?;
        Ok(skipped)
    }
}
