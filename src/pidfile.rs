//! Single-writer exclusivity via `pid.cdb` (spec §6, §9 "Global process
//! state"). Liveness is probed through `/proc` on Linux, matching the
//! original's portability note: "on non-Linux platforms substitute a file
//! lock rather than a `/proc` check" — this crate targets Linux hosts, the
//! teacher's own deployment target, so only the `/proc` probe is wired up.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const PID_FILE_NAME: &str = "pid.cdb";

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Reads any existing pid file and fails if it names a live process.
    /// On success, writes the current pid and returns a guard that removes
    /// the file on `close`.
    #[tracing::instrument(skip_all, fields(dir = %dir.display()))]
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(PID_FILE_NAME);
        if let Ok(contents) = fs::read_to_string(&path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                let pid: u32 = trimmed
                    .parse()
                    .map_err(|_| Error::InternalError("pid file contents are not a number"))?;
                if process_is_alive(pid) {
                    return Err(Error::OpenedByAnotherProcess { pid });
                }
                tracing::warn!(pid, "stale pid file from a dead process, reclaiming");
            }
        }
        fs::write(&path, std::process::id().to_string()).map_err(|e| Error::FileOpenFailed {
            path: path.clone(),
            source: e,
        })?;
        Ok(Self { path })
    }

    pub fn release(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(pid: u32) -> bool {
    // Best-effort fallback for non-Linux hosts: signal 0 just probes
    // existence/permission without delivering anything.
    unsafe { libc_kill_probe(pid) }
}

#[cfg(not(target_os = "linux"))]
fn libc_kill_probe(_pid: u32) -> bool {
    // Conservative: assume alive when we cannot probe, matching the spec's
    // fatal-by-default posture for "pid file unreadable".
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidFile::acquire(dir.path()).unwrap();
        let contents = fs::read_to_string(dir.path().join(PID_FILE_NAME)).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        guard.release();
        assert!(!dir.path().join(PID_FILE_NAME).exists());
    }

    #[test]
    fn stale_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PID_FILE_NAME), "999999999").unwrap();
        let guard = PidFile::acquire(dir.path()).unwrap();
        guard.release();
    }

    #[test]
    fn live_pid_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PID_FILE_NAME), std::process::id().to_string()).unwrap();
        let err = PidFile::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, Error::OpenedByAnotherProcess { .. }));
    }
}
