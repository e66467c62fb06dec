//! Spawns the start/stop/restart commands with a merged environment,
//! captured output, and an optional double-fork on the daemon's behalf.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::DaemonError;

/// Poll interval while waiting for the direct child to exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How one spawn attempt played out.
///
/// The `pid` is always the *direct* child's: for classic daemons that is
/// the short-lived fork parent, not the long-running daemon, so a
/// successful variant only confirms the parent-visible child exited 0.
#[derive(Debug)]
pub enum LaunchResult {
    /// The direct child exited 0 (or was reaped elsewhere).
    Ok {
        /// PID of the direct child.
        pid: i32,
        /// Combined stdout+stderr, if capture was enabled.
        output: Option<String>,
    },
    /// The direct child exited non-zero or died on a signal.
    Failed {
        /// PID of the direct child.
        pid: i32,
        /// Combined stdout+stderr, if capture was enabled.
        output: Option<String>,
        /// The child's exit status.
        status: ExitStatus,
    },
    /// The deadline expired while the direct child was still running.
    ///
    /// The child is left alive; the supervisor owns the abort protocol.
    SpawnTimedOut {
        /// PID of the direct child.
        pid: i32,
        /// Whatever output was captured before the deadline.
        output: Option<String>,
    },
}

/// Per-spawn settings derived from the daemon handle.
#[derive(Debug, Default)]
pub struct LaunchOptions {
    /// Extra environment merged over the ambient environment.
    pub env: HashMap<String, String>,
    /// Descriptors the child keeps beyond stdin/stdout/stderr.
    pub keep_fds: Vec<RawFd>,
    /// Perform the fork → setsid → fork protocol before exec.
    pub daemonize: bool,
    /// Capture combined output to a private temp file. Disabled when the
    /// handle's log file is itself a standard channel; the child then
    /// inherits the caller's stdout/stderr.
    pub capture_output: bool,
}

/// Runs `sh -c <command>` and waits for the direct child.
///
/// The capture file is a `NamedTempFile`, removed when this function
/// returns on any path. With `deadline` set, expiry yields
/// [`LaunchResult::SpawnTimedOut`] instead of killing the child.
pub fn run(
    command: &str,
    options: &LaunchOptions,
    deadline: Option<Instant>,
) -> Result<LaunchResult, DaemonError> {
    let capture = if options.capture_output {
        Some(NamedTempFile::new()?)
    } else {
        None
    };

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).stdin(Stdio::null());
    match &capture {
        Some(file) => {
            cmd.stdout(Stdio::from(file.reopen()?));
            cmd.stderr(Stdio::from(file.reopen()?));
        }
        None => {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
    }
    cmd.envs(&options.env);

    if !options.keep_fds.is_empty() || options.daemonize {
        let keep_fds = options.keep_fds.clone();
        let daemonize = options.daemonize;
        // Runs in the forked child right before exec; only async-signal-safe
        // calls are allowed here.
        unsafe {
            cmd.pre_exec(move || child_setup(&keep_fds, daemonize));
        }
    }

    let mut child = cmd.spawn()?;
    let pid = child.id() as i32;
    debug!(pid, %command, "spawned command");

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = read_capture(capture.as_ref())?;
                return Ok(if status.success() {
                    LaunchResult::Ok { pid, output }
                } else {
                    debug!(pid, ?status, "command failed");
                    LaunchResult::Failed {
                        pid,
                        output,
                        status,
                    }
                });
            }
            Ok(None) => {}
            Err(error) if error.raw_os_error() == Some(libc::ECHILD) => {
                // Reaped concurrently; the PID and log probes report the truth.
                debug!(pid, "child already reaped, assuming success");
                return Ok(LaunchResult::Ok {
                    pid,
                    output: read_capture(capture.as_ref())?,
                });
            }
            Err(error) => return Err(error.into()),
        }

        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            debug!(pid, "deadline expired while waiting for command");
            return Ok(LaunchResult::SpawnTimedOut {
                pid,
                output: read_capture(capture.as_ref())?,
            });
        }

        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Renders the exit-information suffix used in error messages.
pub(crate) fn exit_suffix(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {code}"),
        (None, Some(signum)) => {
            let name = Signal::try_from(signum)
                .map(|signal| signal.as_str().to_owned())
                .unwrap_or_else(|_| signum.to_string());
            format!("terminated with signal {name}")
        }
        (None, None) => "exited".to_owned(),
    }
}

fn read_capture(capture: Option<&NamedTempFile>) -> Result<Option<String>, DaemonError> {
    match capture {
        None => Ok(None),
        Some(file) => {
            let bytes = fs::read(file.path())?;
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
    }
}

/// Post-fork, pre-exec setup: un-CLOEXEC the retained descriptors, then
/// optionally detach via setsid plus a second fork whose intermediate
/// exits 0 for the waiting parent.
fn child_setup(keep_fds: &[RawFd], daemonize: bool) -> io::Result<()> {
    for &fd in keep_fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if daemonize {
        if unsafe { libc::setsid() } < 0 {
            return Err(io::Error::last_os_error());
        }
        match unsafe { libc::fork() } {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => unsafe { libc::_exit(0) },
        }
    }

    Ok(())
}
