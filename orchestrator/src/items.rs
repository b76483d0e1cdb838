//! Backlog item ingestion for `mason items`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::core::types::{BacklogItem, ItemStatus};
use crate::io::store::{NewItem, Store};

/// Parse a JSON array of items.
pub fn parse_items(raw: &str) -> Result<Vec<NewItem>> {
    serde_json::from_str(raw).context("parse items json (expected an array of objects)")
}

/// Insert every item in `path`. Nothing is inserted if any item is invalid.
pub fn import_items(store: &mut Store, path: &Path) -> Result<Vec<BacklogItem>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let items = parse_items(&raw)?;
    for (idx, item) in items.iter().enumerate() {
        item.validate()
            .with_context(|| format!("item #{} in {}", idx + 1, path.display()))?;
    }
    let imported = store
        .insert_items(&items)
        .with_context(|| format!("import {}", path.display()))?;
    info!(count = imported.len(), path = %path.display(), "imported items");
    Ok(imported)
}

/// Approve `new` or `failed` items so `mason execute` picks them up.
pub fn approve_items(store: &mut Store, ids: &[String]) -> Result<Vec<BacklogItem>> {
    ids.iter()
        .map(|id| {
            store
                .set_item_status(id, ItemStatus::Approved)
                .with_context(|| format!("approve item '{id}'"))
        })
        .collect()
}
