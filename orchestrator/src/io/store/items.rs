use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Deserialize;
use tracing::debug;

use super::{Store, StoreError, get_enum, now};
use crate::core::transitions::item_transition_allowed;
use crate::core::types::{BacklogItem, ItemStatus};

pub(super) const ITEM_COLUMNS: &str = "id, title, problem, solution, item_type, priority, complexity, status, branch_name, created_at, updated_at";

/// Input for a new backlog item (also the JSON shape accepted by `items import`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewItem {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub solution: String,
    #[serde(default = "default_item_type")]
    pub item_type: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    #[serde(default = "default_status")]
    pub status: ItemStatus,
}

fn default_item_type() -> String {
    "feature".to_string()
}

fn default_complexity() -> u8 {
    2
}

fn default_status() -> ItemStatus {
    ItemStatus::New
}

impl NewItem {
    /// An approved item with default metadata.
    pub fn approved(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            problem: String::new(),
            solution: String::new(),
            item_type: default_item_type(),
            priority: 0,
            complexity: default_complexity(),
            status: ItemStatus::Approved,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.title.trim().is_empty() {
            return Err(StoreError::InvalidInput("item title must not be empty".into()));
        }
        if !(1..=5).contains(&self.complexity) {
            return Err(StoreError::InvalidInput(format!(
                "complexity must be between 1 and 5 (got {})",
                self.complexity
            )));
        }
        if !matches!(self.status, ItemStatus::New | ItemStatus::Approved) {
            return Err(StoreError::InvalidInput(format!(
                "new items must be new or approved (got {})",
                self.status
            )));
        }
        Ok(())
    }
}

pub(super) fn item_from_row(row: &Row<'_>) -> rusqlite::Result<BacklogItem> {
    Ok(BacklogItem {
        id: row.get(0)?,
        title: row.get(1)?,
        problem: row.get(2)?,
        solution: row.get(3)?,
        item_type: row.get(4)?,
        priority: row.get(5)?,
        complexity: row.get(6)?,
        status: get_enum(row, 7)?,
        branch_name: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl Store {
    pub fn insert_item(&mut self, item: NewItem) -> Result<BacklogItem, StoreError> {
        let id = insert_item_row(&self.conn, &item)?;
        self.require_item(&id)
    }

    /// Insert every item or none of them.
    pub fn insert_items(&mut self, items: &[NewItem]) -> Result<Vec<BacklogItem>, StoreError> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(insert_item_row(&tx, item)?);
        }
        tx.commit()?;
        ids.iter().map(|id| self.require_item(id)).collect()
    }

    pub fn get_item(&self, id: &str) -> Result<Option<BacklogItem>, StoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM backlog_items WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], item_from_row)
            .optional()?)
    }

    pub(crate) fn require_item(&self, id: &str) -> Result<BacklogItem, StoreError> {
        self.get_item(id)?.ok_or_else(|| StoreError::UnknownId {
            kind: "item",
            id: id.to_string(),
        })
    }

    /// Items ordered by priority (desc), then age.
    pub fn list_items(&self, status: Option<ItemStatus>) -> Result<Vec<BacklogItem>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM backlog_items \
             WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY priority DESC, created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.map(ItemStatus::as_str)], item_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Move an item along its state machine.
    pub fn set_item_status(
        &mut self,
        id: &str,
        to: ItemStatus,
    ) -> Result<BacklogItem, StoreError> {
        let tx = self.conn.transaction()?;
        set_item_status_tx(&tx, id, to)?;
        tx.commit()?;
        self.require_item(id)
    }
}

pub(super) fn set_item_status_tx(
    tx: &rusqlite::Transaction<'_>,
    id: &str,
    to: ItemStatus,
) -> Result<(), StoreError> {
    let from: Option<ItemStatus> = tx
        .query_row(
            "SELECT status FROM backlog_items WHERE id = ?1",
            params![id],
            |row| get_enum(row, 0),
        )
        .optional()?;
    let from = from.ok_or_else(|| StoreError::UnknownId {
        kind: "item",
        id: id.to_string(),
    })?;
    if !item_transition_allowed(from, to) {
        return Err(StoreError::InvalidTransition {
            kind: "item",
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    tx.execute(
        "UPDATE backlog_items SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![to.as_str(), now(), id],
    )?;
    debug!(item_id = id, %from, %to, "item status updated");
    Ok(())
}

fn insert_item_row(conn: &Connection, item: &NewItem) -> Result<String, StoreError> {
    item.validate()?;
    let id = item
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ts = now();
    conn.execute(
        "INSERT INTO backlog_items(id, title, problem, solution, item_type, priority, complexity, status, branch_name, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?9)",
        params![
            id,
            item.title.trim(),
            item.problem,
            item.solution,
            item.item_type,
            item.priority,
            item.complexity,
            item.status.as_str(),
            ts,
        ],
    )?;
    debug!(item_id = %id, "item inserted");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_list_by_status() {
        let mut store = Store::open_in_memory().expect("store");
        let approved = store.insert_item(NewItem::approved("Approved one")).expect("insert");
        store
            .insert_item(NewItem {
                status: ItemStatus::New,
                ..NewItem::approved("Draft")
            })
            .expect("insert");

        let listed = store.list_items(Some(ItemStatus::Approved)).expect("list");
        assert_eq!(listed, vec![approved]);
        assert_eq!(store.list_items(None).expect("list").len(), 2);
    }

    #[test]
    fn rejects_invalid_items() {
        let mut store = Store::open_in_memory().expect("store");
        let err = store.insert_item(NewItem::approved("  ")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));

        let err = store
            .insert_item(NewItem {
                status: ItemStatus::Completed,
                ..NewItem::approved("x")
            })
            .unwrap_err();
        assert!(err.to_string().contains("new or approved"));
    }

    #[test]
    fn batch_insert_is_all_or_nothing() {
        let mut store = Store::open_in_memory().expect("store");
        let with_id = |id: &str| NewItem {
            id: Some(id.to_string()),
            ..NewItem::approved(id)
        };

        let err = store
            .insert_items(&[with_id("a"), with_id("b"), with_id("a")])
            .unwrap_err();
        assert!(matches!(err, StoreError::Sql(_)), "{err:?}");
        assert!(store.list_items(None).expect("list").is_empty());

        let inserted = store
            .insert_items(&[with_id("a"), with_id("b")])
            .expect("insert");
        assert_eq!(inserted.len(), 2);
    }

    #[test]
    fn status_changes_follow_state_machine() {
        let mut store = Store::open_in_memory().expect("store");
        let item = store.insert_item(NewItem::approved("x")).expect("insert");

        let err = store
            .set_item_status(&item.id, ItemStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let updated = store
            .set_item_status(&item.id, ItemStatus::InProgress)
            .expect("claim");
        assert_eq!(updated.status, ItemStatus::InProgress);
    }

    #[test]
    fn import_json_defaults() {
        let parsed: Vec<NewItem> =
            serde_json::from_str(r#"[{"title": "Speed up builds", "status": "approved"}]"#)
                .expect("parse");
        assert_eq!(parsed[0].item_type, "feature");
        assert_eq!(parsed[0].complexity, 2);
        assert_eq!(parsed[0].status, ItemStatus::Approved);
    }
}
