use std::io;
use std::time::Duration;

use thiserror::Error;

/// Defines all possible errors that can occur while supervising a daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The daemon is already running; `start` refuses to race it.
    #[error("daemon '{identifier}' is already started")]
    AlreadyStarted {
        /// The handle identifier.
        identifier: String,
    },

    /// The start command failed, or the daemon died after forking.
    #[error("daemon '{identifier}' failed to start: {details}")]
    Start {
        /// The handle identifier.
        identifier: String,
        /// Captured output, log diff and exit information.
        details: String,
    },

    /// The daemon did not come up within the start deadline.
    #[error("daemon '{identifier}' failed to start in time: {details}")]
    StartTimeout {
        /// The handle identifier.
        identifier: String,
        /// Captured output, log diff and timeout information.
        details: String,
    },

    /// The stop command failed.
    #[error("failed to stop daemon '{identifier}': {details}")]
    Stop {
        /// The handle identifier.
        identifier: String,
        /// Captured output and exit information.
        details: String,
    },

    /// Graceful stop exceeded its deadline; a forced kill was performed.
    #[error("daemon '{identifier}' did not stop within {timeout:?} and was killed")]
    StopTimeout {
        /// The handle identifier.
        identifier: String,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// The connect probe still failed after a successful start.
    #[error("cannot connect to daemon '{identifier}' even though it appears to be running")]
    Connect {
        /// The handle identifier.
        identifier: String,
        /// The most recent connect-pending error, if the probe reported one.
        #[source]
        source: Option<io::Error>,
    },

    /// The handle was constructed with missing or inconsistent fields.
    #[error("invalid daemon configuration: {0}")]
    InvalidConfig(String),

    /// Environmental I/O failure from the lock, PID file or log file.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<nix::errno::Errno> for DaemonError {
    fn from(errno: nix::errno::Errno) -> Self {
        DaemonError::Io(io::Error::from(errno))
    }
}
