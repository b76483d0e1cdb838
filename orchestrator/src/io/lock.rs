//! Advisory per-repository lock.
//!
//! The lock is a JSON file created with `create_new` (`O_CREAT | O_EXCL`), so
//! two racing invocations have exactly one winner. It lives outside the store
//! so `mason lock status` works even when the database is unreadable.
//!
//! A lock whose holder process no longer exists is stale. Stale locks are
//! reported, never removed implicitly; removal needs [`Takeover::Stale`].
//! An unreadable lock file counts as stale once it is older than
//! [`ABANDONED_AFTER`]; younger ones may still be mid-write.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Age after which an unreadable lock file is treated as abandoned.
pub const ABANDONED_AFTER: Duration = Duration::from_secs(5);

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub command: String,
    pub acquired_at: String,
    pub repo: String,
    /// Random per-acquisition token; release only succeeds when it matches.
    pub token: String,
}

impl LockInfo {
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Human-readable "who's holding it" line.
    pub fn describe(&self) -> String {
        format!(
            "pid {} (command: {}) since {}",
            self.pid, self.command, self.acquired_at
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("repository is locked by {}", .holder.describe())]
    LockHeld { holder: LockInfo },
    #[error(
        "stale lock left by {} (process is gone); re-run with --takeover-stale-lock or `mason lock clear` after checking the repository",
        .holder.describe()
    )]
    StaleLock { holder: LockInfo },
    #[error("lock file {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("lock io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Whether `acquire` may remove a stale lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Takeover {
    #[default]
    Never,
    /// Operator-directed: replace a lock whose holder is dead. Live holders are
    /// still refused.
    Stale,
}

/// Result of inspecting the lock file without touching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held(LockInfo),
    Stale(LockInfo),
}

/// An acquired lock. Dropping it releases the lock file if still owned.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now instead of on drop.
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        release(&self.path, &self.info.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release(&self.path, &self.info.token) {
            warn!(err = %err, "failed to release lock on drop");
        }
    }
}

/// Create the lock file at `path` for `command`.
pub fn acquire(
    path: &Path,
    repo: &Path,
    command: &str,
    takeover: Takeover,
) -> Result<LockGuard, LockError> {
    let info = LockInfo {
        pid: std::process::id(),
        command: command.to_string(),
        acquired_at: Utc::now().to_rfc3339(),
        repo: repo.display().to_string(),
        token: uuid::Uuid::new_v4().to_string(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| io_err(parent, source))?;
    }

    match try_create(path, &info) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => match inspect(path)? {
            LockStatus::Free => try_create(path, &info).map_err(|source| io_err(path, source))?,
            LockStatus::Held(holder) => return Err(LockError::LockHeld { holder }),
            LockStatus::Stale(holder) => {
                if takeover != Takeover::Stale {
                    return Err(LockError::StaleLock { holder });
                }
                take_over_stale(path, &holder)?;
                try_create(path, &info).map_err(|source| match source.kind() {
                    ErrorKind::AlreadyExists => match read_lock(path) {
                        Ok(Some(holder)) => LockError::LockHeld { holder },
                        _ => io_err(path, source),
                    },
                    _ => io_err(path, source),
                })?;
            }
        },
        Err(source) => return Err(io_err(path, source)),
    }

    info!(path = %path.display(), command, "lock acquired");
    Ok(LockGuard {
        path: path.to_path_buf(),
        info,
        released: false,
    })
}

/// Remove the lock file if `token` still owns it. No-op otherwise.
pub fn release(path: &Path, token: &str) -> Result<bool, LockError> {
    match read_lock(path) {
        Ok(Some(current)) if current.token == token => {
            fs::remove_file(path).map_err(|source| io_err(path, source))?;
            debug!(path = %path.display(), "lock released");
            Ok(true)
        }
        Ok(Some(_)) => {
            warn!(path = %path.display(), "lock owned by another holder, not releasing");
            Ok(false)
        }
        Ok(None) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Report the lock state for diagnostics.
pub fn inspect(path: &Path) -> Result<LockStatus, LockError> {
    match read_lock(path) {
        Ok(None) => Ok(LockStatus::Free),
        Ok(Some(info)) if info.is_alive() => Ok(LockStatus::Held(info)),
        Ok(Some(info)) => Ok(LockStatus::Stale(info)),
        Err(LockError::Corrupt { path, reason }) => match abandoned(&path)? {
            Some(info) => Ok(LockStatus::Stale(info)),
            None => Err(LockError::Corrupt { path, reason }),
        },
        Err(err) => Err(err),
    }
}

/// Operator-directed removal of a stale lock. Refuses live holders.
pub fn clear_stale(path: &Path) -> Result<Option<LockInfo>, LockError> {
    match inspect(path)? {
        LockStatus::Free => Ok(None),
        LockStatus::Held(holder) => Err(LockError::LockHeld { holder }),
        LockStatus::Stale(holder) => {
            take_over_stale(path, &holder)?;
            Ok(Some(holder))
        }
    }
}

fn try_create(path: &Path, info: &LockInfo) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let json = serde_json::to_string_pretty(info).map_err(std::io::Error::other)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()
}

/// Move the stale file aside, then verify we moved the file we inspected. If
/// another invocation replaced it in between, put theirs back.
fn take_over_stale(path: &Path, stale: &LockInfo) -> Result<(), LockError> {
    let tombstone = path.with_extension(format!("stale-{}", uuid::Uuid::new_v4()));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(io_err(path, source)),
    }
    let moved = match read_lock(&tombstone) {
        Ok(moved) => moved,
        Err(LockError::Corrupt { .. }) => abandoned(&tombstone)?,
        Err(err) => return Err(err),
    };
    if moved.as_ref().map(|m| &m.token) != Some(&stale.token) {
        // Hard link fails if a new lock already exists, so a newer holder is never clobbered.
        let _ = fs::hard_link(&tombstone, path);
        let _ = fs::remove_file(&tombstone);
        return match moved {
            Some(holder) => Err(LockError::LockHeld { holder }),
            None => Ok(()),
        };
    }
    fs::remove_file(&tombstone).map_err(|source| io_err(&tombstone, source))?;
    info!(pid = stale.pid, command = %stale.command, "stale lock removed by operator request");
    Ok(())
}

fn read_lock(path: &Path) -> Result<Option<LockInfo>, LockError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_err(path, source)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|err| LockError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

/// Placeholder holder for an unreadable lock file old enough to have been
/// abandoned by a crashed writer. Its empty token never matches a real lock.
fn abandoned(path: &Path) -> Result<Option<LockInfo>, LockError> {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_err(path, source)),
    };
    let old_enough = SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age >= ABANDONED_AFTER);
    if !old_enough {
        return Ok(None);
    }
    Ok(Some(LockInfo {
        pid: 0,
        command: "unknown (unreadable lock file)".to_string(),
        acquired_at: DateTime::<Utc>::from(modified).to_rfc3339(),
        repo: String::new(),
        token: String::new(),
    }))
}

fn io_err(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 checks existence; EPERM means it exists under another user.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Assume alive so a stale lock is never reported where we cannot check.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stale_info(path: &Path) -> LockInfo {
        LockInfo {
            pid: 4_000_000,
            command: "execute".to_string(),
            acquired_at: "2026-01-01T00:00:00+00:00".to_string(),
            repo: path.display().to_string(),
            token: "old".to_string(),
        }
    }

    fn write_info(path: &Path, info: &LockInfo) {
        fs::write(path, serde_json::to_string(info).expect("json")).expect("write lock");
    }

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn bogus_pid_is_dead() {
        assert!(!pid_alive(4_000_000));
    }

    #[test]
    fn second_acquire_reports_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        let guard = acquire(&path, temp.path(), "execute", Takeover::Never).expect("acquire");

        let err = acquire(&path, temp.path(), "status", Takeover::Never).unwrap_err();
        match err {
            LockError::LockHeld { holder } => {
                assert_eq!(holder.command, "execute");
                assert_eq!(holder.acquired_at, guard.info().acquired_at);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drop_releases_and_allows_reacquire() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        {
            let _guard = acquire(&path, temp.path(), "execute", Takeover::Never).expect("acquire");
            assert!(path.exists());
        }
        assert!(!path.exists());
        acquire(&path, temp.path(), "execute", Takeover::Never).expect("reacquire");
    }

    #[test]
    fn release_ignores_foreign_token() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        let _guard = acquire(&path, temp.path(), "execute", Takeover::Never).expect("acquire");
        assert!(!release(&path, "someone-else").expect("release"));
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn stale_lock_requires_explicit_takeover() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        write_info(&path, &stale_info(temp.path()));

        let err = acquire(&path, temp.path(), "execute", Takeover::Never).unwrap_err();
        assert!(matches!(err, LockError::StaleLock { .. }));
        assert!(path.exists());

        let guard = acquire(&path, temp.path(), "execute", Takeover::Stale).expect("takeover");
        assert_eq!(guard.info().pid, std::process::id());
    }

    #[test]
    fn takeover_never_removes_live_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        let _guard = acquire(&path, temp.path(), "execute", Takeover::Never).expect("acquire");
        let err = acquire(&path, temp.path(), "execute", Takeover::Stale).unwrap_err();
        assert!(matches!(err, LockError::LockHeld { .. }));
        assert!(matches!(clear_stale(&path), Err(LockError::LockHeld { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn clear_stale_removes_dead_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        write_info(&path, &stale_info(temp.path()));
        let cleared = clear_stale(&path).expect("clear");
        assert_eq!(cleared.map(|h| h.token), Some("old".to_string()));
        assert_eq!(inspect(&path).expect("inspect"), LockStatus::Free);
    }

    fn age(path: &Path, by: Duration) {
        fs::File::options()
            .write(true)
            .open(path)
            .expect("open lock")
            .set_modified(SystemTime::now() - by)
            .expect("set mtime");
    }

    #[test]
    fn old_empty_lock_is_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        fs::write(&path, "").expect("write lock");
        age(&path, Duration::from_secs(60));

        let err = acquire(&path, temp.path(), "execute", Takeover::Never).unwrap_err();
        assert!(matches!(err, LockError::StaleLock { .. }), "{err}");
        let guard = acquire(&path, temp.path(), "execute", Takeover::Stale).expect("takeover");
        assert_eq!(guard.info().pid, std::process::id());
        assert!(release(&path, &guard.info().token).expect("release"));
    }

    #[test]
    fn old_garbled_lock_can_be_cleared() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        fs::write(&path, "{\"pid\": 12").expect("write lock");
        age(&path, Duration::from_secs(60));

        let cleared = clear_stale(&path).expect("clear").expect("holder");
        assert!(cleared.token.is_empty());
        assert_eq!(inspect(&path).expect("inspect"), LockStatus::Free);
    }

    #[test]
    fn fresh_unreadable_lock_is_reported_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        fs::write(&path, "").expect("write lock");

        assert!(matches!(inspect(&path), Err(LockError::Corrupt { .. })));
        assert!(matches!(
            acquire(&path, temp.path(), "execute", Takeover::Stale),
            Err(LockError::Corrupt { .. })
        ));
        assert!(path.exists());
    }

    #[test]
    fn concurrent_acquires_have_one_winner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("execute.lock");
        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        acquire(&path, temp.path(), "execute", Takeover::Never)
                            .map(std::mem::forget)
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("join"))
                .collect()
        });
        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    }
}
