//! Item selection for `mason execute`.

use std::cmp::Reverse;

use super::types::{BacklogItem, ItemStatus};

/// How the operator asked for items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Exactly these ids, in the given order.
    Ids(Vec<String>),
    /// The first `n` eligible items by priority.
    Top(usize),
    /// Every eligible item.
    All,
}

impl Default for Selection {
    fn default() -> Self {
        Selection::Top(1)
    }
}

/// An item the driver may pick up, and whether it continues an interrupted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub item: BacklogItem,
    /// Id of a `pending`/`running` run left behind by an interrupted invocation.
    pub resume_run_id: Option<String>,
}

/// Why an explicitly requested id could not be selected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("unknown item '{0}'")]
    UnknownItem(String),
    #[error("item '{id}' is {status}, expected approved")]
    NotEligible { id: String, status: ItemStatus },
}

/// Order candidates: resumed runs first, then priority desc, created_at asc, id.
pub fn order_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        let key = |c: &Candidate| {
            (
                c.resume_run_id.is_none(),
                Reverse(c.item.priority),
                c.item.created_at.clone(),
                c.item.id.clone(),
            )
        };
        key(a).cmp(&key(b))
    });
}

/// Apply `selection` to eligible candidates.
///
/// `all_items` is consulted only to explain why an explicit id was rejected.
pub fn select_items(
    selection: &Selection,
    mut candidates: Vec<Candidate>,
    all_items: &[BacklogItem],
) -> Result<Vec<Candidate>, SelectionError> {
    order_candidates(&mut candidates);
    match selection {
        Selection::All => Ok(candidates),
        Selection::Top(n) => {
            candidates.truncate(*n);
            Ok(candidates)
        }
        Selection::Ids(ids) => {
            let mut picked = Vec::with_capacity(ids.len());
            for id in ids {
                if picked.iter().any(|c: &Candidate| &c.item.id == id) {
                    continue;
                }
                match candidates.iter().find(|c| &c.item.id == id) {
                    Some(candidate) => picked.push(candidate.clone()),
                    None => {
                        return Err(match all_items.iter().find(|item| &item.id == id) {
                            Some(item) => SelectionError::NotEligible {
                                id: id.clone(),
                                status: item.status,
                            },
                            None => SelectionError::UnknownItem(id.clone()),
                        });
                    }
                }
            }
            Ok(picked)
        }
    }
}
