//! Release the repository lock when the process is interrupted.
//!
//! SIGINT, SIGTERM and SIGHUP are blocked on the calling thread (and so on every
//! thread it spawns afterwards) and consumed by a watcher thread with
//! `sigwait`. On delivery the watcher removes the lock file if this process
//! still owns it and exits with `128 + signo`. Run and task rows are left as
//! they are; the next invocation resumes them.
//!
//! Child processes start with an empty signal mask, so agents still see
//! Ctrl-C from the terminal.

use std::path::PathBuf;

use anyhow::Result;

/// Install the watcher for the lock at `lock_path` owned by `token`.
///
/// Must be called before any worker thread is spawned.
#[cfg(unix)]
pub fn install(lock_path: PathBuf, token: String) -> Result<()> {
    use anyhow::Context;
    use nix::sys::signal::{SigSet, Signal};
    use tracing::{debug, warn};

    let mut set = SigSet::empty();
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        set.add(signal);
    }
    set.thread_block().context("block termination signals")?;

    std::thread::Builder::new()
        .name("mason-signals".to_string())
        .spawn(move || match set.wait() {
            Ok(signal) => {
                warn!(%signal, "interrupted, releasing lock");
                match crate::io::lock::release(&lock_path, &token) {
                    Ok(released) => debug!(released, "lock release on signal"),
                    Err(err) => warn!(err = %err, "failed to release lock on signal"),
                }
                eprintln!("mason: interrupted by {signal}; resume with `mason execute`");
                std::process::exit(128 + signal as i32);
            }
            Err(err) => warn!(err = %err, "signal watcher stopped"),
        })
        .context("spawn signal watcher")?;
    Ok(())
}

/// Signals are not intercepted on this platform; the lock guard's drop still
/// releases the lock on normal exit.
#[cfg(not(unix))]
pub fn install(_lock_path: PathBuf, _token: String) -> Result<()> {
    Ok(())
}
