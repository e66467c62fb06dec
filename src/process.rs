//! Thin capability over real OS process state, so tests can substitute a
//! fake for the signal/reap half of the abort protocol.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::DaemonError;

/// What the supervisor needs from the operating system: liveness probes,
/// signals, and reaping its own direct children.
pub trait ProcessControl: Send + Sync {
    /// Signal-0 probe. `ESRCH` means gone; `EPERM` means alive but owned by
    /// another user; other errors propagate.
    fn alive(&self, pid: i32) -> Result<bool, DaemonError>;

    /// Sends `signal` to `pid`.
    fn kill(&self, pid: i32, signal: Signal) -> Result<(), Errno>;

    /// Non-blocking reap of a direct child.
    ///
    /// Returns `true` when the child has been collected (or was already
    /// reaped elsewhere, reported as `ECHILD`), `false` while it is still
    /// running.
    fn try_reap(&self, pid: i32) -> Result<bool, DaemonError>;
}

/// The production implementation, backed by `kill(2)` and `waitpid(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn alive(&self, pid: i32) -> Result<bool, DaemonError> {
        match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(Errno::EPERM) => Ok(true),
            Err(errno) => Err(errno.into()),
        }
    }

    fn kill(&self, pid: i32, signal: Signal) -> Result<(), Errno> {
        signal::kill(Pid::from_raw(pid), signal)
    }

    fn try_reap(&self, pid: i32) -> Result<bool, DaemonError> {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(false),
            Ok(status) => {
                debug!(pid, ?status, "reaped child");
                Ok(true)
            }
            // Already collected elsewhere; the PID and log probes report the truth.
            Err(Errno::ECHILD) => Ok(true),
            Err(errno) => Err(errno.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn alive_detects_own_process() {
        let procs = SystemProcesses;
        assert!(procs.alive(std::process::id() as i32).expect("alive"));
    }

    #[test]
    fn alive_detects_absent_pid() {
        let procs = SystemProcesses;
        // Way beyond any default pid_max.
        assert!(!procs.alive(99_999_999).expect("alive"));
    }

    #[test]
    fn try_reap_collects_exited_child() {
        let procs = SystemProcesses;
        let child = Command::new("true").spawn().expect("spawn");
        let pid = child.id() as i32;

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if procs.try_reap(pid).expect("try_reap") {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "child never reaped");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
