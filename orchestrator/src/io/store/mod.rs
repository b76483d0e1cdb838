//! Durable run and task store backed by SQLite.
//!
//! Every status transition is written (and committed) before the call returns;
//! crash recovery relies on the store being the last word on what happened.
//! The orchestrator is the only writer during a run, so writes use plain
//! last-writer-wins updates guarded by the transition tables in
//! [`crate::core::transitions`].

mod error;
mod items;
mod runs;
mod schema;
mod tasks;

pub use error::StoreError;
pub use items::NewItem;
pub use runs::NewRun;
pub use schema::CURRENT_SCHEMA_VERSION;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use rusqlite::types::Type;
use tracing::debug;

#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) and migrate the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, path)
    }

    /// Private in-memory store, used by tests and dry runs without a data dir.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(mut conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = FULL;")?;
        let version = schema::migrate(&mut conn)?;
        debug!(path = %path.display(), version, "store opened");
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        schema::current_version(&self.conn)
    }

    /// Close the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, err)| StoreError::Sql(err))
    }
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Read a column holding the string form of a status or tag enum.
pub(crate) fn get_enum<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_keeps_schema_and_data() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("mason.db");
        let mut store = Store::open(&path).expect("open");
        store
            .insert_item(NewItem::approved("Persist me"))
            .expect("insert");
        store.close().expect("close");

        let store = Store::open(&path).expect("reopen");
        assert_eq!(store.schema_version().expect("version"), CURRENT_SCHEMA_VERSION);
        assert_eq!(store.list_items(None).expect("list").len(), 1);
    }
}
