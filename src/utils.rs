//! Utility functions for sandbox operations

use crate::errors::{Result, SandboxError};
use nix::unistd::{access, AccessFlags};
#[cfg(test)]
use std::cell::Cell;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[cfg(test)]
thread_local! {
    static ROOT_OVERRIDE: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Search path used when neither the program environment nor the caller sets PATH
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Check if running as root
pub fn is_root() -> bool {
    #[cfg(test)]
    {
        if let Some(value) = ROOT_OVERRIDE.with(|cell| cell.get()) {
            return value;
        }
    }

    unsafe { libc::geteuid() == 0 }
}

/// Get current UID
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Get current GID
pub fn get_gid() -> u32 {
    unsafe { libc::getegid() }
}

/// Parse memory size string (e.g., "100M", "1G")
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| SandboxError::InvalidConfig(format!("Invalid memory size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| SandboxError::InvalidConfig(format!("Memory size overflow: {}", s)))
}

/// Split a raw argument string into an argument vector.
///
/// Tokens are separated by runs of whitespace; quoting is not interpreted.
pub fn split_arguments(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Resolve a program name to a path using PATH semantics.
///
/// Names containing a `/` are returned unchanged. Bare names are looked up in
/// `search_path` (or [`DEFAULT_PATH`]) and the first executable hit wins.
pub fn resolve_program_path(program: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }

    let path_value = search_path.unwrap_or_else(|| OsStr::new(DEFAULT_PATH));
    for entry in std::env::split_paths(path_value) {
        let dir = if entry.as_os_str().is_empty() { Path::new(".") } else { entry.as_path() };
        let candidate = dir.join(program);

        if candidate.is_file() && access(&candidate, AccessFlags::X_OK).is_ok() {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
pub fn set_root_override(value: Option<bool>) {
    ROOT_OVERRIDE.with(|cell| cell.set(value));
}
