//! Process supervision (C10): a PID file guarding against two daemon
//! instances fighting over the same kernel state, with a signal-0 liveness
//! probe so a stale file left by a crashed process doesn't block a restart.

use std::path::Path;

use nix::sys::signal;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("another overlayd instance is already running (pid {0})")]
    AlreadyRunning(i32),
}

/// Reads an existing PID file and, if its process is still alive (a
/// signal-0 probe succeeds), refuses to proceed. A PID file whose process
/// is gone is treated as stale and silently replaced.
pub fn acquire(path: &Path) -> Result<(), Error> {
    if let Ok(raw) = std::fs::read_to_string(path) {
        if let Ok(pid) = raw.trim().parse::<i32>() {
            if signal::kill(Pid::from_raw(pid), None).is_ok() {
                return Err(Error::AlreadyRunning(pid));
            }
            tracing::warn!(stale_pid = pid, "removing stale PID file");
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

/// Removes the PID file on clean shutdown. Tolerant of the file already
/// being gone.
pub fn release(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlayd.pid");
        acquire(&path).unwrap();
        let written: i32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id() as i32);
    }

    #[test]
    fn acquire_rejects_when_a_live_process_holds_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlayd.pid");
        // our own pid is always "alive" from our own perspective
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        assert!(matches!(acquire(&path), Err(Error::AlreadyRunning(_))));
    }

    #[test]
    fn acquire_replaces_a_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlayd.pid");
        // pid 1 could plausibly be alive on a real Linux box (it's init);
        // use a pid far outside any live range instead to model "gone".
        std::fs::write(&path, "2147483647").unwrap();
        acquire(&path).unwrap();
        let written: i32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id() as i32);
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.pid");
        release(&path);
    }
}
