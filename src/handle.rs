use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::DaemonError;
use crate::ping::PingSpec;

/// A command to run, either fixed up front or produced at invocation time.
///
/// The dynamic form lets callers pick ports, temp directories or flags at the
/// moment the daemon is actually started rather than when the handle is built.
pub enum CommandSource {
    /// A literal `sh -c` command string.
    Literal(String),
    /// A callable that yields the command string on each invocation.
    Dynamic(Box<dyn Fn() -> String + Send + Sync>),
}

impl CommandSource {
    /// Resolves the command string for this invocation.
    pub fn resolve(&self) -> String {
        match self {
            CommandSource::Literal(command) => command.clone(),
            CommandSource::Dynamic(producer) => producer(),
        }
    }
}

impl From<&str> for CommandSource {
    fn from(command: &str) -> Self {
        CommandSource::Literal(command.to_owned())
    }
}

impl From<String> for CommandSource {
    fn from(command: String) -> Self {
        CommandSource::Literal(command)
    }
}

impl fmt::Debug for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSource::Literal(command) => f.debug_tuple("Literal").field(command).finish(),
            CommandSource::Dynamic(_) => f.debug_tuple("Dynamic").field(&"Fn() -> String").finish(),
        }
    }
}

/// Immutable configuration and identity of one supervised daemon.
///
/// Built via [`DaemonHandle::builder`]; validated once, then shared freely.
pub struct DaemonHandle {
    pub(crate) identifier: String,
    pub(crate) start_command: CommandSource,
    pub(crate) stop_command: Option<CommandSource>,
    pub(crate) restart_command: Option<CommandSource>,
    pub(crate) before_start: Option<Box<dyn Fn() + Send + Sync>>,
    pub(crate) ping_spec: PingSpec,
    pub(crate) pid_file_path: PathBuf,
    pub(crate) log_file_path: PathBuf,
    pub(crate) lock_file_path: PathBuf,
    pub(crate) start_timeout: Duration,
    pub(crate) stop_timeout: Duration,
    pub(crate) start_abort_timeout: Duration,
    pub(crate) log_file_activity_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) stop_graceful_signal: Signal,
    pub(crate) dont_stop_if_pid_file_invalid: bool,
    pub(crate) daemonize_for_me: bool,
    pub(crate) keep_fds: Vec<RawFd>,
    pub(crate) env: HashMap<String, String>,
}

impl DaemonHandle {
    /// Starts building a handle from the mandatory fields.
    pub fn builder(
        identifier: impl Into<String>,
        start_command: impl Into<CommandSource>,
        ping_spec: PingSpec,
        pid_file_path: impl Into<PathBuf>,
        log_file_path: impl Into<PathBuf>,
    ) -> DaemonHandleBuilder {
        DaemonHandleBuilder {
            identifier: identifier.into(),
            start_command: start_command.into(),
            stop_command: None,
            restart_command: None,
            before_start: None,
            ping_spec,
            pid_file_path: pid_file_path.into(),
            log_file_path: log_file_path.into(),
            lock_file_path: None,
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            start_abort_timeout: Duration::from_secs(10),
            log_file_activity_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_millis(100),
            stop_graceful_signal: Signal::SIGTERM,
            dont_stop_if_pid_file_invalid: false,
            daemonize_for_me: false,
            keep_fds: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Returns the human-readable identifier used in error messages.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the path of the daemon's PID file.
    pub fn pid_file_path(&self) -> &Path {
        &self.pid_file_path
    }

    /// Returns the path of the daemon's log file.
    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    /// Returns the path of the supervisor's lock file.
    pub fn lock_file_path(&self) -> &Path {
        &self.lock_file_path
    }
}

impl fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("identifier", &self.identifier)
            .field("start_command", &self.start_command)
            .field("stop_command", &self.stop_command)
            .field("restart_command", &self.restart_command)
            .field("before_start", &self.before_start.as_ref().map(|_| "Fn()"))
            .field("ping_spec", &self.ping_spec)
            .field("pid_file_path", &self.pid_file_path)
            .field("log_file_path", &self.log_file_path)
            .field("lock_file_path", &self.lock_file_path)
            .field("start_timeout", &self.start_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .field("start_abort_timeout", &self.start_abort_timeout)
            .field(
                "log_file_activity_timeout",
                &self.log_file_activity_timeout,
            )
            .field("ping_interval", &self.ping_interval)
            .field("stop_graceful_signal", &self.stop_graceful_signal)
            .field(
                "dont_stop_if_pid_file_invalid",
                &self.dont_stop_if_pid_file_invalid,
            )
            .field("daemonize_for_me", &self.daemonize_for_me)
            .field("keep_fds", &self.keep_fds)
            .field("env", &self.env)
            .finish()
    }
}

/// Builder for [`DaemonHandle`]; `build` validates the configuration.
pub struct DaemonHandleBuilder {
    identifier: String,
    start_command: CommandSource,
    stop_command: Option<CommandSource>,
    restart_command: Option<CommandSource>,
    before_start: Option<Box<dyn Fn() + Send + Sync>>,
    ping_spec: PingSpec,
    pid_file_path: PathBuf,
    log_file_path: PathBuf,
    lock_file_path: Option<PathBuf>,
    start_timeout: Duration,
    stop_timeout: Duration,
    start_abort_timeout: Duration,
    log_file_activity_timeout: Duration,
    ping_interval: Duration,
    stop_graceful_signal: Signal,
    dont_stop_if_pid_file_invalid: bool,
    daemonize_for_me: bool,
    keep_fds: Vec<RawFd>,
    env: HashMap<String, String>,
}

impl DaemonHandleBuilder {
    /// Sets the command used to stop the daemon instead of signalling its PID.
    pub fn stop_command(mut self, command: impl Into<CommandSource>) -> Self {
        self.stop_command = Some(command.into());
        self
    }

    /// Sets the command used to restart the daemon instead of stop+start.
    pub fn restart_command(mut self, command: impl Into<CommandSource>) -> Self {
        self.restart_command = Some(command.into());
        self
    }

    /// Runs before the start command; not counted against the start deadline.
    pub fn before_start(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_start = Some(Box::new(hook));
        self
    }

    /// Overrides the lock file path (default: `<pid_file_path>.lock`).
    pub fn lock_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file_path = Some(path.into());
        self
    }

    /// Wall-clock limit for a whole start attempt.
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Wall-clock limit for a graceful stop before the forced kill.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Limit on each wait step of the abort protocol.
    pub fn start_abort_timeout(mut self, timeout: Duration) -> Self {
        self.start_abort_timeout = timeout;
        self
    }

    /// Longest tolerated silence in the log file during a start attempt.
    pub fn log_file_activity_timeout(mut self, timeout: Duration) -> Self {
        self.log_file_activity_timeout = timeout;
        self
    }

    /// Interval between liveness polls while waiting.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Signal sent for a graceful stop when no stop command is configured.
    pub fn stop_graceful_signal(mut self, signal: Signal) -> Self {
        self.stop_graceful_signal = signal;
        self
    }

    /// If `true`, `stop` succeeds without acting when the PID file is invalid.
    pub fn dont_stop_if_pid_file_invalid(mut self, value: bool) -> Self {
        self.dont_stop_if_pid_file_invalid = value;
        self
    }

    /// If `true`, the launcher double-forks and `setsid`s on the daemon's behalf.
    pub fn daemonize_for_me(mut self, value: bool) -> Self {
        self.daemonize_for_me = value;
        self
    }

    /// File descriptors the daemon inherits beyond stdin/stdout/stderr.
    pub fn keep_fds(mut self, fds: impl IntoIterator<Item = RawFd>) -> Self {
        self.keep_fds = fds.into_iter().collect();
        self
    }

    /// Adds an environment variable merged over the ambient environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Validates the configuration and produces the immutable handle.
    pub fn build(self) -> Result<DaemonHandle, DaemonError> {
        if self.identifier.trim().is_empty() {
            return Err(DaemonError::InvalidConfig(
                "identifier must not be empty".into(),
            ));
        }

        let lock_file_path = self.lock_file_path.unwrap_or_else(|| {
            let mut path = self.pid_file_path.clone().into_os_string();
            path.push(".lock");
            PathBuf::from(path)
        });

        for (label, path) in [
            ("pid_file_path", &self.pid_file_path),
            ("log_file_path", &self.log_file_path),
            ("lock_file_path", &lock_file_path),
        ] {
            if !path.is_absolute() {
                return Err(DaemonError::InvalidConfig(format!(
                    "{label} must be absolute, got {}",
                    path.display()
                )));
            }
        }

        for (label, duration) in [
            ("start_timeout", self.start_timeout),
            ("stop_timeout", self.stop_timeout),
            ("start_abort_timeout", self.start_abort_timeout),
            (
                "log_file_activity_timeout",
                self.log_file_activity_timeout,
            ),
            ("ping_interval", self.ping_interval),
        ] {
            if duration.is_zero() {
                return Err(DaemonError::InvalidConfig(format!(
                    "{label} must be greater than zero"
                )));
            }
        }

        Ok(DaemonHandle {
            identifier: self.identifier,
            start_command: self.start_command,
            stop_command: self.stop_command,
            restart_command: self.restart_command,
            before_start: self.before_start,
            ping_spec: self.ping_spec,
            pid_file_path: self.pid_file_path,
            log_file_path: self.log_file_path,
            lock_file_path,
            start_timeout: self.start_timeout,
            stop_timeout: self.stop_timeout,
            start_abort_timeout: self.start_abort_timeout,
            log_file_activity_timeout: self.log_file_activity_timeout,
            ping_interval: self.ping_interval,
            stop_graceful_signal: self.stop_graceful_signal,
            dont_stop_if_pid_file_invalid: self.dont_stop_if_pid_file_invalid,
            daemonize_for_me: self.daemonize_for_me,
            keep_fds: self.keep_fds,
            env: self.env,
        })
    }
}
