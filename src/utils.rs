//! Shared utility functions for the craftvisor daemon.

use chrono::{Local, NaiveDateTime, Timelike};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Local wall-clock time without offset, truncated to whole seconds so it
/// survives the `yyyy-MM-dd HH:mm:ss` store format unchanged.
pub fn now_local() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// chrono format of backup folder names.
pub const BACKUP_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Folder name used for a backup taken now, e.g. `20240501_030000`.
pub fn backup_stamp() -> String {
    Local::now().format(BACKUP_STAMP_FORMAT).to_string()
}

/// Inverse of [`backup_stamp`]; `None` for any other folder name.
pub fn parse_backup_stamp(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, BACKUP_STAMP_FORMAT).ok()
}
