//! Process-identity bookkeeping for cluster workers, supplementing
//! `spec.md` §4.9 with the PID-file/socket-path conventions
//! `original_source/` uses for daemon bookkeeping (`SPEC_FULL.md`,
//! "process-identity bookkeeping").
//!
//! Purely additive: nothing here changes `spec.md`'s fork/restart
//! invariants, it just gives a cluster deployment a way to find a running
//! master's PID from outside the process (e.g. a `corewire stop` CLI).

use std::fs;
use std::io;
use std::path::PathBuf;

/// Directory PID files live under; `dirs::runtime_dir()` falls back to the
/// system temp dir when `XDG_RUNTIME_DIR` is unset.
fn runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Path to the PID file for scheme/cluster `id`.
#[must_use]
pub fn pid_file_path(id: u16) -> PathBuf {
    runtime_dir().join(format!("corewire-{id}.pid"))
}

/// Write the current process's PID to `id`'s PID file.
pub fn write_pid_file(id: u16) -> io::Result<()> {
    let path = pid_file_path(id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, std::process::id().to_string())
}

/// Read back a previously-written PID file, if present and parseable.
#[must_use]
pub fn read_pid_file(id: u16) -> Option<u32> {
    let contents = fs::read_to_string(pid_file_path(id)).ok()?;
    contents.trim().parse().ok()
}

/// Remove `id`'s PID file, ignoring a missing file.
pub fn remove_pid_file(id: u16) -> io::Result<()> {
    match fs::remove_file(pid_file_path(id)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether `pid` refers to a still-running process, via `kill(pid, 0)`
/// (sends no signal, only checks existence/permission).
#[cfg(unix)]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 is the documented existence-check idiom; no signal is
    // actually delivered.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0
}

#[cfg(not(unix))]
#[must_use]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Remove `id`'s PID file if it points at a process that is no longer
/// running — called on master startup to clean up after an unclean exit.
pub fn cleanup_stale(id: u16) {
    if let Some(pid) = read_pid_file(id) {
        if !is_process_alive(pid) {
            let _ = remove_pid_file(id);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove_round_trip() {
        let id = 65000;
        write_pid_file(id).expect("write pid file");
        assert_eq!(read_pid_file(id), Some(std::process::id()));
        remove_pid_file(id).expect("remove pid file");
        assert_eq!(read_pid_file(id), None);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_or_unused_pid_is_not_alive() {
        assert!(!is_process_alive(u32::MAX));
    }
}
