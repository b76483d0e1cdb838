//! Read-only views for `mason runs` and `mason lock`.

use anyhow::Result;

use crate::core::reconcile::wave_counts;
use crate::core::types::{ExecutionRun, ExecutionTask, WaveCounts};
use crate::io::lock::{self, LockInfo, LockStatus};
use crate::io::init::MasonPaths;
use crate::io::store::Store;

/// A run with its tasks grouped by wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDetail {
    pub run: ExecutionRun,
    pub waves: Vec<WaveDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveDetail {
    pub number: u32,
    pub counts: WaveCounts,
    pub tasks: Vec<ExecutionTask>,
}

pub fn run_detail(store: &Store, run_id: &str) -> Result<RunDetail> {
    let run = store.require_run(run_id)?;
    let rows = store.tasks_for_run(run_id)?;
    let waves = (1..=run.total_waves)
        .map(|number| WaveDetail {
            number,
            counts: wave_counts(&rows, number),
            tasks: rows.iter().filter(|t| t.wave == number).cloned().collect(),
        })
        .collect();
    Ok(RunDetail { run, waves })
}

/// Human-readable lock state.
pub fn describe_lock(paths: &MasonPaths) -> Result<String> {
    Ok(match lock::inspect(&paths.lock_path)? {
        LockStatus::Free => "unlocked".to_string(),
        LockStatus::Held(info) => format!("locked by {} (alive)", info.describe()),
        LockStatus::Stale(info) => format!(
            "stale lock from {} (process is gone); remove with `mason lock clear`",
            info.describe()
        ),
    })
}

/// Remove a stale lock. Live holders are refused.
pub fn clear_lock(paths: &MasonPaths) -> Result<Option<LockInfo>> {
    Ok(lock::clear_stale(&paths.lock_path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planner::{generate_waves_for_item, planned_tasks};
    use crate::io::lock::Takeover;
    use crate::io::store::{NewItem, NewRun};

    #[test]
    fn run_detail_groups_tasks_by_wave() {
        let mut store = Store::open_in_memory().expect("store");
        let item = store.insert_item(NewItem::approved("Group")).expect("insert");
        let waves = generate_waves_for_item(&item);
        let run = store
            .create_run(NewRun {
                item_id: &item.id,
                branch_name: "mason/group",
                backup_branch: "mason-backup/1",
                original_head: "abc",
                original_branch: None,
                total_waves: waves.len() as u32,
                tasks: &planned_tasks(&waves),
            })
            .expect("run");

        let detail = run_detail(&store, &run.id).expect("detail");
        assert_eq!(detail.waves.len(), waves.len());
        for (wave, planned) in detail.waves.iter().zip(&waves) {
            assert_eq!(wave.tasks.len(), planned.tasks.len());
            assert_eq!(wave.counts.pending as usize, planned.tasks.len());
        }
    }

    #[test]
    fn lock_description_tracks_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = MasonPaths::new(temp.path(), None);
        assert_eq!(describe_lock(&paths).expect("describe"), "unlocked");

        let guard = lock::acquire(&paths.lock_path, temp.path(), "mason execute", Takeover::Never)
            .expect("acquire");
        let described = describe_lock(&paths).expect("describe");
        assert!(described.contains("mason execute"));
        assert!(described.contains("(alive)"));

        // A live holder is never cleared.
        assert!(clear_lock(&paths).is_err());
        guard.release().expect("release");
        assert_eq!(clear_lock(&paths).expect("clear"), None);
    }
}
