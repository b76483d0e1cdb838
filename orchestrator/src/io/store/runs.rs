use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::{debug, info};

use super::items::{ITEM_COLUMNS, item_from_row, set_item_status_tx};
use super::tasks::insert_missing_tasks_tx;
use super::{Store, StoreError, get_enum, now};
use crate::core::transitions::run_transition_allowed;
use crate::core::types::{BacklogItem, ExecutionRun, ItemStatus, PlannedTask, RunStatus};

const RUN_COLUMNS: &str = "id, status, current_wave, total_waves, branch_name, backup_branch, original_head, created_at, started_at, completed_at, error_message, original_branch";

/// Everything persisted when an item is claimed.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub item_id: &'a str,
    pub branch_name: &'a str,
    pub backup_branch: &'a str,
    pub original_head: &'a str,
    pub original_branch: Option<&'a str>,
    pub total_waves: u32,
    pub tasks: &'a [PlannedTask],
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRun> {
    Ok(ExecutionRun {
        id: row.get(0)?,
        item_ids: Vec::new(),
        status: get_enum(row, 1)?,
        current_wave: row.get(2)?,
        total_waves: row.get(3)?,
        branch_name: row.get(4)?,
        backup_branch: row.get(5)?,
        original_head: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        error_message: row.get(10)?,
        original_branch: row.get(11)?,
    })
}

impl Store {
    /// Claim an approved item and persist its run plus every planned task row
    /// (all `pending`) in one transaction.
    pub fn create_run(&mut self, new: NewRun<'_>) -> Result<ExecutionRun, StoreError> {
        if new.total_waves == 0 {
            return Err(StoreError::InvalidInput("a run needs at least one wave".into()));
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let ts = now();

        let tx = self.conn.transaction()?;
        set_item_status_tx(&tx, new.item_id, ItemStatus::InProgress)?;
        tx.execute(
            "UPDATE backlog_items SET branch_name = ?1 WHERE id = ?2",
            params![new.branch_name, new.item_id],
        )?;
        tx.execute(
            "INSERT INTO execution_runs(id, status, current_wave, total_waves, branch_name, backup_branch, original_head, original_branch, created_at) \
             VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                RunStatus::Pending.as_str(),
                new.total_waves,
                new.branch_name,
                new.backup_branch,
                new.original_head,
                new.original_branch,
                ts,
            ],
        )?;
        tx.execute(
            "INSERT INTO execution_run_items(run_id, item_id, position) VALUES (?1, ?2, 0)",
            params![run_id, new.item_id],
        )?;
        let inserted = insert_missing_tasks_tx(&tx, &run_id, new.tasks)?;
        tx.commit()?;

        info!(run_id = %run_id, item_id = new.item_id, tasks = inserted, "run created");
        self.require_run(&run_id)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<ExecutionRun>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM execution_runs WHERE id = ?1");
        let run = self
            .conn
            .query_row(&sql, params![id], run_from_row)
            .optional()?;
        run.map(|run| self.with_items(run)).transpose()
    }

    pub(crate) fn require_run(&self, id: &str) -> Result<ExecutionRun, StoreError> {
        self.get_run(id)?.ok_or_else(|| StoreError::UnknownId {
            kind: "run",
            id: id.to_string(),
        })
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<ExecutionRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM execution_runs ORDER BY created_at DESC, id ASC LIMIT ?1"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params![limit], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        runs.into_iter().map(|run| self.with_items(run)).collect()
    }

    /// In-progress items that own a `pending`/`running` run, with that run id.
    ///
    /// These are runs an earlier invocation started but never finalized.
    pub fn resumable_items(&self) -> Result<Vec<(BacklogItem, String)>, StoreError> {
        let columns: String = ITEM_COLUMNS
            .split(", ")
            .map(|c| format!("i.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns}, r.id FROM backlog_items i \
             JOIN execution_run_items ri ON ri.item_id = i.id \
             JOIN execution_runs r ON r.id = ri.run_id \
             WHERE i.status = ?1 AND r.status IN (?2, ?3) \
             ORDER BY r.created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                ItemStatus::InProgress.as_str(),
                RunStatus::Pending.as_str(),
                RunStatus::Running.as_str()
            ],
            |row| Ok((item_from_row(row)?, row.get::<_, String>(11)?)),
        )?;
        let mut out: Vec<(BacklogItem, String)> = Vec::new();
        for row in rows {
            let (item, run_id) = row?;
            // One open run per item; if several exist the oldest wins.
            if !out.iter().any(|(existing, _)| existing.id == item.id) {
                out.push((item, run_id));
            }
        }
        Ok(out)
    }

    /// Move a run along its state machine, stamping start/finish times.
    pub fn transition_run(
        &mut self,
        id: &str,
        to: RunStatus,
        error_message: Option<&str>,
    ) -> Result<ExecutionRun, StoreError> {
        let tx = self.conn.transaction()?;
        transition_run_tx(&tx, id, to, error_message)?;
        tx.commit()?;
        self.require_run(id)
    }

    /// Record that `wave` is now executing. Waves only move forward.
    pub fn advance_wave(&mut self, id: &str, wave: u32) -> Result<(), StoreError> {
        let run = self.require_run(id)?;
        if wave < run.current_wave {
            return Err(StoreError::WaveRegression {
                id: id.to_string(),
                current: run.current_wave,
                requested: wave,
            });
        }
        if wave > run.total_waves {
            return Err(StoreError::InvalidInput(format!(
                "wave {wave} exceeds total_waves {} for run '{id}'",
                run.total_waves
            )));
        }
        self.conn.execute(
            "UPDATE execution_runs SET current_wave = ?1 WHERE id = ?2",
            params![wave, id],
        )?;
        Ok(())
    }

    /// Finalize a run and its items in one transaction.
    pub fn finish_run(
        &mut self,
        id: &str,
        to: RunStatus,
        error_message: Option<&str>,
    ) -> Result<ExecutionRun, StoreError> {
        let item_status = match to {
            RunStatus::Completed => ItemStatus::Completed,
            RunStatus::Failed => ItemStatus::Failed,
            other => {
                return Err(StoreError::InvalidInput(format!(
                    "finish_run expects completed or failed, got {other}"
                )));
            }
        };
        let item_ids = self.require_run(id)?.item_ids;
        let tx = self.conn.transaction()?;
        transition_run_tx(&tx, id, to, error_message)?;
        for item_id in &item_ids {
            set_item_status_tx(&tx, item_id, item_status)?;
        }
        tx.commit()?;
        self.require_run(id)
    }

    fn with_items(&self, mut run: ExecutionRun) -> Result<ExecutionRun, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id FROM execution_run_items WHERE run_id = ?1 ORDER BY position ASC",
        )?;
        run.item_ids = stmt
            .query_map(params![run.id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        if run.item_ids.is_empty() {
            return Err(StoreError::corrupt(
                "execution_run_items",
                format!("run '{}' has no items", run.id),
            ));
        }
        Ok(run)
    }
}

fn transition_run_tx(
    tx: &Transaction<'_>,
    id: &str,
    to: RunStatus,
    error_message: Option<&str>,
) -> Result<(), StoreError> {
    let from = run_status_tx(tx, id)?;
    if !run_transition_allowed(from, to) {
        return Err(StoreError::InvalidTransition {
            kind: "run",
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    let ts = now();
    let started_at = (to == RunStatus::Running).then_some(ts.as_str());
    let completed_at = to.is_terminal().then_some(ts.as_str());
    tx.execute(
        "UPDATE execution_runs SET status = ?1, \
            started_at = COALESCE(started_at, ?2), \
            completed_at = COALESCE(?3, completed_at), \
            error_message = COALESCE(?4, error_message) \
         WHERE id = ?5",
        params![to.as_str(), started_at, completed_at, error_message, id],
    )?;
    debug!(run_id = id, %from, %to, "run status updated");
    Ok(())
}

fn run_status_tx(tx: &Transaction<'_>, id: &str) -> Result<RunStatus, StoreError> {
    let status: Option<RunStatus> = tx
        .query_row(
            "SELECT status FROM execution_runs WHERE id = ?1",
            params![id],
            |row| get_enum(row, 0),
        )
        .optional()?;
    status.ok_or_else(|| StoreError::UnknownId {
        kind: "run",
        id: id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planner::{generate_waves_for_item, planned_tasks};
    use crate::io::store::NewItem;

    fn claim(store: &mut Store, title: &str) -> (BacklogItem, ExecutionRun) {
        let item = store.insert_item(NewItem::approved(title)).expect("insert");
        let waves = generate_waves_for_item(&item);
        let tasks = planned_tasks(&waves);
        let run = store
            .create_run(NewRun {
                item_id: &item.id,
                branch_name: "mason/x",
                backup_branch: "mason-backup/1",
                original_head: "abc123",
                original_branch: Some("main"),
                total_waves: waves.len() as u32,
                tasks: &tasks,
            })
            .expect("create run");
        (item, run)
    }

    #[test]
    fn create_run_claims_item_and_persists_plan() {
        let mut store = Store::open_in_memory().expect("store");
        let (item, run) = claim(&mut store, "Claim me");

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.item_ids, vec![item.id.clone()]);
        assert_eq!(run.total_waves, 3);
        assert_eq!(run.current_wave, 0);

        let item = store.require_item(&item.id).expect("item");
        assert_eq!(item.status, ItemStatus::InProgress);
        assert_eq!(item.branch_name.as_deref(), Some("mason/x"));

        let tasks = store.tasks_for_run(&run.id).expect("tasks");
        assert!(!tasks.is_empty());
        assert!(tasks.iter().all(|t| t.status.as_str() == "pending"));
    }

    #[test]
    fn create_run_refuses_unapproved_items() {
        let mut store = Store::open_in_memory().expect("store");
        let item = store
            .insert_item(NewItem {
                status: ItemStatus::New,
                ..NewItem::approved("draft")
            })
            .expect("insert");
        let err = store
            .create_run(NewRun {
                item_id: &item.id,
                branch_name: "b",
                backup_branch: "bb",
                original_head: "h",
                original_branch: None,
                total_waves: 1,
                tasks: &[],
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert!(store.list_runs(10).expect("runs").is_empty());
    }

    #[test]
    fn run_transitions_are_enforced_and_stamped() {
        let mut store = Store::open_in_memory().expect("store");
        let (_, run) = claim(&mut store, "x");

        let err = store
            .transition_run(&run.id, RunStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let running = store
            .transition_run(&run.id, RunStatus::Running, None)
            .expect("start");
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let done = store
            .finish_run(&run.id, RunStatus::Failed, Some("boom"))
            .expect("finish");
        assert_eq!(done.error_message.as_deref(), Some("boom"));
        assert!(done.completed_at.is_some());
        let item = store.require_item(&done.item_ids[0]).expect("item");
        assert_eq!(item.status, ItemStatus::Failed);
    }

    #[test]
    fn finish_run_rolls_back_when_an_item_update_fails() {
        let mut store = Store::open_in_memory().expect("store");
        let (item, run) = claim(&mut store, "x");
        store
            .transition_run(&run.id, RunStatus::Running, None)
            .expect("start");
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER refuse_completion BEFORE UPDATE OF status ON backlog_items \
                 WHEN NEW.status = 'completed' \
                 BEGIN SELECT RAISE(ABORT, 'refused'); END;",
            )
            .expect("trigger");

        assert!(store.finish_run(&run.id, RunStatus::Completed, None).is_err());

        let run = store.require_run(&run.id).expect("run");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());
        let item = store.require_item(&item.id).expect("item");
        assert_eq!(item.status, ItemStatus::InProgress);
        assert_eq!(store.resumable_items().expect("resumable").len(), 1);
    }

    #[test]
    fn waves_only_move_forward() {
        let mut store = Store::open_in_memory().expect("store");
        let (_, run) = claim(&mut store, "x");
        store.advance_wave(&run.id, 2).expect("advance");
        store.advance_wave(&run.id, 2).expect("same wave");
        let err = store.advance_wave(&run.id, 1).unwrap_err();
        assert!(matches!(err, StoreError::WaveRegression { current: 2, .. }));
        assert!(store.advance_wave(&run.id, 4).is_err());
    }

    #[test]
    fn resumable_items_lists_open_runs_only() {
        let mut store = Store::open_in_memory().expect("store");
        let (open_item, open_run) = claim(&mut store, "open");
        let (_, done_run) = claim(&mut store, "done");
        store
            .transition_run(&done_run.id, RunStatus::Running, None)
            .expect("start");
        store
            .finish_run(&done_run.id, RunStatus::Completed, None)
            .expect("finish");

        let resumable = store.resumable_items().expect("resumable");
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].0.id, open_item.id);
        assert_eq!(resumable[0].1, open_run.id);
    }
}
