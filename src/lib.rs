//! Supervise a single external local daemon: start it on demand, stop it,
//! query liveness, and connect to it, race-free across threads and
//! processes that share the same daemon identity.
//!
//! ```no_run
//! use daemonguard::{DaemonHandle, PingSpec, Supervisor};
//!
//! let handle = DaemonHandle::builder(
//!     "search",
//!     "searchd --config /etc/searchd.conf",
//!     PingSpec::tcp("127.0.0.1", 3230),
//!     "/var/run/searchd.pid",
//!     "/var/log/searchd.log",
//! )
//! .build()?;
//!
//! let searchd = Supervisor::new(handle);
//! if !searchd.running()? {
//!     searchd.start()?;
//! }
//! # Ok::<(), daemonguard::DaemonError>(())
//! ```

#![warn(unused_crate_dependencies)]
// Only exercised by the integration tests in tests/.
#[cfg(test)]
use tracing_subscriber as _;

/// Errors.
pub mod error;

/// Daemon configuration and identity.
pub mod handle;

/// Command spawning.
pub mod launch;

/// Shared/exclusive file locking.
pub mod lock;

/// Log snapshot and diff.
pub mod log_watch;

/// PID file access.
pub mod pid_file;

/// Liveness probes.
pub mod ping;

/// OS process capability.
pub mod process;

/// The start/stop/connect state machine.
pub mod supervisor;

pub use error::DaemonError;
pub use handle::{CommandSource, DaemonHandle, DaemonHandleBuilder};
pub use launch::{LaunchOptions, LaunchResult};
pub use ping::{PingSpec, ProbeStatus};
pub use process::{ProcessControl, SystemProcesses};
pub use supervisor::Supervisor;
