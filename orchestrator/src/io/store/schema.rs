//! Forward-only schema migrations tracked in `schema_versions`.

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::info;

use super::StoreError;

/// Ordered migrations. Never edit a shipped entry; append a new one instead.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "baseline_tables", V1_BASELINE),
    (2, "lookup_indexes", V2_INDEXES),
    (3, "run_original_branch", V3_RUN_ORIGINAL_BRANCH),
];

pub const CURRENT_SCHEMA_VERSION: i64 = 3;

const V1_BASELINE: &str = "
CREATE TABLE backlog_items (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    problem TEXT NOT NULL,
    solution TEXT NOT NULL,
    item_type TEXT NOT NULL DEFAULT 'feature',
    priority INTEGER NOT NULL DEFAULT 0,
    complexity INTEGER NOT NULL DEFAULT 2,
    status TEXT NOT NULL
        CHECK (status IN ('new', 'approved', 'in_progress', 'completed', 'failed')),
    branch_name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE execution_runs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
    current_wave INTEGER NOT NULL DEFAULT 0,
    total_waves INTEGER NOT NULL,
    branch_name TEXT NOT NULL,
    backup_branch TEXT NOT NULL,
    original_head TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT
);

CREATE TABLE execution_run_items (
    run_id TEXT NOT NULL REFERENCES execution_runs(id) ON DELETE CASCADE,
    item_id TEXT NOT NULL REFERENCES backlog_items(id),
    position INTEGER NOT NULL,
    PRIMARY KEY (run_id, item_id)
);

CREATE TABLE execution_tasks (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES execution_runs(id) ON DELETE CASCADE,
    wave INTEGER NOT NULL,
    task_number INTEGER NOT NULL,
    subagent_type TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'running', 'completed', 'failed', 'skipped')),
    output TEXT,
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    UNIQUE (run_id, wave, task_number)
);
";

const V2_INDEXES: &str = "
CREATE INDEX idx_backlog_items_status ON backlog_items(status);
CREATE INDEX idx_execution_runs_status ON execution_runs(status);
CREATE INDEX idx_execution_run_items_item ON execution_run_items(item_id);
CREATE INDEX idx_execution_tasks_run_wave ON execution_tasks(run_id, wave, status);
";

const V3_RUN_ORIGINAL_BRANCH: &str = "
ALTER TABLE execution_runs ADD COLUMN original_branch TEXT;
";

pub(crate) fn migrate(conn: &mut Connection) -> Result<i64, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current = current_version(conn)?;
    if current > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found: current,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    for (version, name, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_versions(version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![version, name, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        info!(version, name, "applied store migration");
    }

    current_version(conn)
}

pub(crate) fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_versions",
        [],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_contiguous_and_current() {
        for (idx, (version, _, _)) in MIGRATIONS.iter().enumerate() {
            assert_eq!(*version, idx as i64 + 1);
        }
        assert_eq!(MIGRATIONS.last().map(|m| m.0), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().expect("open");
        assert_eq!(migrate(&mut conn).expect("first"), CURRENT_SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn).expect("second"), CURRENT_SCHEMA_VERSION);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn upgrade_keeps_existing_runs() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(V1_BASELINE).expect("v1");
        conn.execute_batch(V2_INDEXES).expect("v2");
        conn.execute_batch(
            "CREATE TABLE schema_versions (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL);
             INSERT INTO schema_versions VALUES (1, 'baseline_tables', 'then'), (2, 'lookup_indexes', 'then');
             INSERT INTO execution_runs(id, status, total_waves, branch_name, backup_branch, original_head, created_at)
                 VALUES ('r1', 'running', 3, 'mason/x', 'mason-backup/1', 'abc', 'then');",
        )
        .expect("seed v2 store");

        assert_eq!(migrate(&mut conn).expect("migrate"), CURRENT_SCHEMA_VERSION);
        let original_branch: Option<String> = conn
            .query_row(
                "SELECT original_branch FROM execution_runs WHERE id = 'r1'",
                [],
                |row| row.get(0),
            )
            .expect("select");
        assert_eq!(original_branch, None);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");
        conn.execute(
            "INSERT INTO schema_versions(version, name, applied_at) VALUES (99, 'future', 'now')",
            [],
        )
        .expect("insert");
        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedSchema { found: 99, .. }));
    }
}
