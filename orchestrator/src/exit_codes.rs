//! Stable exit codes for mason CLI commands.

/// Command succeeded; for `execute`, every selected item completed (or there
/// was nothing to do).
pub const OK: i32 = 0;
/// Invalid configuration or selection, store failure, or any other error.
pub const INVALID: i32 = 1;
/// Git state validation failed and `--force` was not given.
pub const GIT_STATE: i32 = 2;
/// Another invocation holds the repository lock, or a stale lock needs an
/// explicit takeover.
pub const LOCK_HELD: i32 = 3;
/// At least one selected item ended `failed`.
pub const ITEMS_FAILED: i32 = 4;
/// The operator declined the confirmation prompt.
pub const DECLINED: i32 = 5;
