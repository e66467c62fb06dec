//! The start/stop/connect/restart state machine.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::handle::DaemonHandle;
use crate::launch::{self, LaunchOptions, LaunchResult};
use crate::lock::LockFile;
use crate::log_watch::{self, LogWatcher};
use crate::pid_file::PidFile;
use crate::ping::{self, ProbeStatus};
use crate::process::{ProcessControl, SystemProcesses};

/// Poll interval while waiting for a stopping daemon to go away.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval inside the abort and force-kill wait loops.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Supervises one external daemon identified by a [`DaemonHandle`].
///
/// All mutating operations serialize through an exclusive `flock` on the
/// handle's lock file, across threads and processes alike; `running`,
/// `pid`, and the fast path of `connect` take only a shared lock.
pub struct Supervisor {
    handle: DaemonHandle,
    lock: LockFile,
    pid_file: PidFile,
    procs: Box<dyn ProcessControl>,
}

impl Supervisor {
    /// Creates a supervisor backed by the real operating system.
    pub fn new(handle: DaemonHandle) -> Self {
        Self::with_process_control(handle, Box::new(SystemProcesses))
    }

    /// Creates a supervisor with a custom [`ProcessControl`], letting tests
    /// fake the signal/reap half of the abort protocol.
    pub fn with_process_control(handle: DaemonHandle, procs: Box<dyn ProcessControl>) -> Self {
        let lock = LockFile::new(&handle.lock_file_path);
        let pid_file = PidFile::new(&handle.pid_file_path);
        Self {
            handle,
            lock,
            pid_file,
            procs,
        }
    }

    /// Returns the handle this supervisor was built from.
    pub fn handle(&self) -> &DaemonHandle {
        &self.handle
    }

    /// Starts the daemon, waiting until it is connectable.
    ///
    /// Fails with [`DaemonError::AlreadyStarted`] when the daemon runs,
    /// [`DaemonError::Start`] when the command fails or the daemon dies
    /// after forking, and [`DaemonError::StartTimeout`] when the deadline
    /// or the log inactivity watchdog trips. Every timeout path runs the
    /// abort protocol before surfacing, so no half-started daemon is left
    /// holding the PID file.
    pub fn start(&self) -> Result<(), DaemonError> {
        self.lock.with_exclusive(|| self.start_locked())
    }

    /// Stops the daemon via the stop command or the graceful signal.
    ///
    /// A daemon that is not running is a no-op success. Exceeding
    /// `stop_timeout` escalates to `SIGKILL` and then fails with
    /// [`DaemonError::StopTimeout`].
    pub fn stop(&self) -> Result<(), DaemonError> {
        self.lock.with_exclusive(|| self.stop_locked())
    }

    /// Restarts the daemon: the restart command if one is configured,
    /// otherwise `stop` followed by `start`.
    pub fn restart(&self) -> Result<(), DaemonError> {
        let Some(restart_command) = &self.handle.restart_command else {
            self.stop()?;
            return self.start();
        };

        self.lock.with_exclusive(|| {
            let command = restart_command.resolve();
            info!(daemon = %self.handle.identifier, %command, "restarting via restart command");
            let deadline = Instant::now() + self.handle.start_timeout;
            match launch::run(&command, &self.launch_options(), Some(deadline))? {
                LaunchResult::Ok { .. } => Ok(()),
                LaunchResult::Failed { output, status, .. } => Err(self.start_error(
                    output.as_deref(),
                    None,
                    &launch::exit_suffix(&status),
                )),
                LaunchResult::SpawnTimedOut { output, .. } => {
                    Err(self.start_error(output.as_deref(), None, "timed out"))
                }
            }
        })
    }

    /// Connects to the daemon, starting it first if needed.
    ///
    /// `probe` attempts a connection and returns `Ok(Some(..))` on success
    /// and `Ok(None)` when the daemon is down; a connect-pending error
    /// (`ECONNREFUSED` and friends, see [`crate::PingSpec::Callable`])
    /// counts as down and is remembered. Many callers may probe a running
    /// daemon concurrently under the shared lock; at most one upgrades to
    /// the exclusive lock and starts it.
    pub fn connect<T, F>(&self, mut probe: F) -> Result<T, DaemonError>
    where
        F: FnMut() -> io::Result<Option<T>>,
    {
        let mut last_pending: Option<io::Error> = None;

        if let Some(value) = self
            .lock
            .with_shared(|| attempt_probe(&mut probe, &mut last_pending))?
        {
            return Ok(value);
        }

        self.lock.with_exclusive(|| {
            if !self.check_running()? {
                debug!(daemon = %self.handle.identifier, "daemon down; starting before reconnect");
                self.start_locked()?;
            }
            match attempt_probe(&mut probe, &mut last_pending)? {
                Some(value) => Ok(value),
                None => Err(DaemonError::Connect {
                    identifier: self.handle.identifier.clone(),
                    source: last_pending.take(),
                }),
            }
        })
    }

    /// Returns whether the daemon is currently running.
    ///
    /// A PID file pointing at a dead process is deleted on the way.
    pub fn running(&self) -> Result<bool, DaemonError> {
        self.lock.with_shared(|| self.check_running())
    }

    /// Returns the PID recorded in the PID file, if any.
    pub fn pid(&self) -> Result<Option<i32>, DaemonError> {
        self.lock.with_shared(|| self.pid_file.read())
    }

    /// The `start` body; the exclusive lock is already held.
    fn start_locked(&self) -> Result<(), DaemonError> {
        if self.check_running()? {
            return Err(DaemonError::AlreadyStarted {
                identifier: self.handle.identifier.clone(),
            });
        }

        let mut log = LogWatcher::snapshot(&self.handle.log_file_path)?;
        // A stale PID file would be indistinguishable from the daemon's own.
        self.pid_file.delete();

        if let Some(hook) = &self.handle.before_start {
            debug!(daemon = %self.handle.identifier, "running before_start hook");
            hook();
        }

        let deadline = Instant::now() + self.handle.start_timeout;
        let command = self.handle.start_command.resolve();
        info!(daemon = %self.handle.identifier, %command, "starting daemon");

        let output = match launch::run(&command, &self.launch_options(), Some(deadline))? {
            LaunchResult::Failed { output, status, .. } => {
                return Err(self.start_error(
                    output.as_deref(),
                    log.diff()?.as_deref(),
                    &launch::exit_suffix(&status),
                ));
            }
            LaunchResult::SpawnTimedOut { pid, output } => {
                self.abort_start(pid, true);
                return Err(self.start_timeout_error(
                    output.as_deref(),
                    log.diff()?.as_deref(),
                ));
            }
            LaunchResult::Ok { output, .. } => output,
        };

        let mut last_activity = Instant::now();

        // Phase 1: the daemon announces itself by writing its PID file.
        while !self.pid_file.available() {
            self.watchdog_tick(&mut log, &mut last_activity, deadline, output.as_deref())?;
            thread::sleep(self.handle.ping_interval);
        }
        debug!(daemon = %self.handle.identifier, "PID file appeared");

        // Phase 2: the daemon becomes connectable.
        loop {
            if self.handle.ping_spec.check()? == ProbeStatus::Up {
                break;
            }
            if !self.check_running()? {
                // Died after writing its PID file; the final probe decides.
                debug!(daemon = %self.handle.identifier, "daemon died while waiting for probe");
                break;
            }
            self.watchdog_tick(&mut log, &mut last_activity, deadline, output.as_deref())?;
            thread::sleep(self.handle.ping_interval);
        }

        if self.handle.ping_spec.check()? == ProbeStatus::Up {
            info!(daemon = %self.handle.identifier, "daemon started");
            Ok(())
        } else {
            Err(self.start_error(None, log.diff()?.as_deref(), ""))
        }
    }

    /// The `stop` body; the exclusive lock is already held.
    fn stop_locked(&self) -> Result<(), DaemonError> {
        let deadline = Instant::now() + self.handle.stop_timeout;

        if let Some(stop_command) = &self.handle.stop_command {
            if self.handle.dont_stop_if_pid_file_invalid && self.pid_file.read()?.is_none() {
                debug!(daemon = %self.handle.identifier, "PID file invalid; skipping stop command");
                return Ok(());
            }
            let command = stop_command.resolve();
            info!(daemon = %self.handle.identifier, %command, "stopping via stop command");
            match launch::run(&command, &self.launch_options(), Some(deadline))? {
                LaunchResult::Ok { .. } => {}
                LaunchResult::Failed { output, status, .. } => {
                    return Err(DaemonError::Stop {
                        identifier: self.handle.identifier.clone(),
                        details: compose_message(
                            output.as_deref(),
                            None,
                            &launch::exit_suffix(&status),
                        ),
                    });
                }
                LaunchResult::SpawnTimedOut { output, .. } => {
                    return Err(DaemonError::Stop {
                        identifier: self.handle.identifier.clone(),
                        details: compose_message(output.as_deref(), None, "timed out"),
                    });
                }
            }
        } else if let Some(pid) = self.pid_file.read()? {
            info!(daemon = %self.handle.identifier, pid, signal = %self.handle.stop_graceful_signal, "signalling daemon");
            match self.procs.kill(pid, self.handle.stop_graceful_signal) {
                Ok(()) | Err(Errno::ESRCH | Errno::ENOENT) => {}
                Err(errno) => return Err(errno.into()),
            }
        }

        while self.check_running()? {
            if Instant::now() >= deadline {
                return Err(self.force_kill());
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        info!(daemon = %self.handle.identifier, "daemon stopped");
        Ok(())
    }

    /// Reads the PID file and probes the recorded process, deleting the
    /// file when the process is gone.
    fn check_running(&self) -> Result<bool, DaemonError> {
        match self.pid_file.read()? {
            None => Ok(false),
            Some(pid) => {
                if self.procs.alive(pid)? {
                    Ok(true)
                } else {
                    warn!(daemon = %self.handle.identifier, pid, "stale PID file; removing");
                    self.pid_file.delete();
                    Ok(false)
                }
            }
        }
    }

    /// One iteration of the inactivity/deadline watchdog used by the start
    /// wait loops. A tripped watchdog aborts the half-started daemon and
    /// yields the timeout error.
    fn watchdog_tick(
        &self,
        log: &mut LogWatcher,
        last_activity: &mut Instant,
        deadline: Instant,
        output: Option<&str>,
    ) -> Result<(), DaemonError> {
        if log.changed()? {
            *last_activity = Instant::now();
        } else if last_activity.elapsed() >= self.handle.log_file_activity_timeout {
            warn!(daemon = %self.handle.identifier, "log went quiet; treating start as silently failed");
            self.abort_pending_start();
            return Err(self.start_timeout_error(output, log.diff()?.as_deref()));
        }

        if Instant::now() >= deadline {
            warn!(daemon = %self.handle.identifier, "start deadline expired");
            self.abort_pending_start();
            return Err(self.start_timeout_error(output, log.diff()?.as_deref()));
        }

        Ok(())
    }

    /// Aborts a start attempt whose daemon may have written a PID file.
    fn abort_pending_start(&self) {
        if let Ok(Some(pid)) = self.pid_file.read() {
            self.abort_start(pid, false);
        }
    }

    /// The abort protocol: `SIGTERM`, bounded wait, then `SIGKILL` and the
    /// same wait again.
    ///
    /// For a direct child the wait is a `waitpid` reap plus PID file
    /// cleanup; the file is deleted only when it names `pid`, because a
    /// daemon that forked just before termination owns both the fork and
    /// the file. For an already-forked daemon the wait polls `running`.
    fn abort_start(&self, pid: i32, is_direct_child: bool) {
        warn!(daemon = %self.handle.identifier, pid, is_direct_child, "aborting start attempt");
        let _ = self.procs.kill(pid, Signal::SIGTERM);
        if !self.await_aborted(pid, is_direct_child) {
            warn!(daemon = %self.handle.identifier, pid, "daemon ignored SIGTERM; sending SIGKILL");
            let _ = self.procs.kill(pid, Signal::SIGKILL);
            self.await_aborted(pid, is_direct_child);
        }
    }

    /// One bounded wait step of the abort protocol; returns whether the
    /// process went away within `start_abort_timeout`.
    fn await_aborted(&self, pid: i32, is_direct_child: bool) -> bool {
        let deadline = Instant::now() + self.handle.start_abort_timeout;

        if is_direct_child {
            loop {
                match self.procs.try_reap(pid) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(_) => break,
                }
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(ABORT_POLL_INTERVAL);
            }
            if let Ok(Some(recorded)) = self.pid_file.read()
                && recorded == pid
            {
                self.pid_file.delete();
            }
            true
        } else {
            loop {
                match self.check_running() {
                    Ok(false) | Err(_) => return true,
                    Ok(true) => {}
                }
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(ABORT_POLL_INTERVAL);
            }
        }
    }

    /// Force-kill path of `stop`: `SIGKILL` the recorded PID, wait for it
    /// to go away, delete the PID file, and report the timeout.
    fn force_kill(&self) -> DaemonError {
        warn!(daemon = %self.handle.identifier, "graceful stop timed out; sending SIGKILL");
        if let Ok(Some(pid)) = self.pid_file.read() {
            let _ = self.procs.kill(pid, Signal::SIGKILL);
            loop {
                match self.check_running() {
                    Ok(true) => thread::sleep(ABORT_POLL_INTERVAL),
                    Ok(false) | Err(_) => break,
                }
            }
        }
        self.pid_file.delete();
        DaemonError::StopTimeout {
            identifier: self.handle.identifier.clone(),
            timeout: self.handle.stop_timeout,
        }
    }

    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            env: self.handle.env.clone(),
            keep_fds: self.handle.keep_fds.clone(),
            daemonize: self.handle.daemonize_for_me,
            capture_output: !log_watch::is_standard_channel(&self.handle.log_file_path),
        }
    }

    fn start_error(
        &self,
        output: Option<&str>,
        logs: Option<&str>,
        suffix: &str,
    ) -> DaemonError {
        DaemonError::Start {
            identifier: self.handle.identifier.clone(),
            details: compose_message(output, logs, suffix),
        }
    }

    fn start_timeout_error(&self, output: Option<&str>, logs: Option<&str>) -> DaemonError {
        DaemonError::StartTimeout {
            identifier: self.handle.identifier.clone(),
            details: compose_message(output, logs, "timed out"),
        }
    }
}

/// Runs the caller's connect probe once, translating connect-pending
/// errors into "down" and remembering the most recent one.
fn attempt_probe<T, F>(
    probe: &mut F,
    last_pending: &mut Option<io::Error>,
) -> Result<Option<T>, DaemonError>
where
    F: FnMut() -> io::Result<Option<T>>,
{
    match probe() {
        Ok(value) => Ok(value),
        Err(error) if ping::is_connect_pending(&error) => {
            debug!(%error, "connect probe reported pending error");
            *last_pending = Some(error);
            Ok(None)
        }
        Err(error) => Err(error.into()),
    }
}

/// Builds the human-readable failure message from captured output, the log
/// diff, and an exit/timeout suffix.
fn compose_message(output: Option<&str>, logs: Option<&str>, suffix: &str) -> String {
    fn placeholder(label: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("({label})")
        } else {
            format!("({label}; {suffix})")
        }
    }

    if output.is_none() && logs.is_none() {
        return placeholder("logs not available", suffix);
    }

    let body = format!("{}\n{}", output.unwrap_or(""), logs.unwrap_or(""))
        .trim()
        .to_owned();
    if body.is_empty() {
        return placeholder("logs empty", suffix);
    }

    if suffix.is_empty() {
        body
    } else {
        format!("{body}\n({suffix})")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::ping::PingSpec;

    #[test]
    fn compose_message_reports_missing_logs() {
        assert_eq!(
            compose_message(None, None, "exited with status 2"),
            "(logs not available; exited with status 2)"
        );
        assert_eq!(compose_message(None, None, ""), "(logs not available)");
    }

    #[test]
    fn compose_message_reports_empty_logs() {
        assert_eq!(
            compose_message(Some(""), Some(""), "timed out"),
            "(logs empty; timed out)"
        );
        assert_eq!(
            compose_message(Some("  \n"), None, "timed out"),
            "(logs empty; timed out)"
        );
    }

    #[test]
    fn compose_message_concatenates_output_and_logs() {
        assert_eq!(
            compose_message(Some("out line"), Some("log line"), "exited with status 1"),
            "out line\nlog line\n(exited with status 1)"
        );
        assert_eq!(
            compose_message(Some("out line"), None, ""),
            "out line"
        );
    }

    /// A process that survives SIGTERM and only dies to SIGKILL; every
    /// signal sent is recorded through the shared log.
    struct StubbornProcess {
        killed: Arc<Mutex<Vec<Signal>>>,
        dead: Arc<AtomicBool>,
    }

    impl StubbornProcess {
        fn new() -> (Self, Arc<Mutex<Vec<Signal>>>, Arc<AtomicBool>) {
            let killed = Arc::new(Mutex::new(Vec::new()));
            let dead = Arc::new(AtomicBool::new(false));
            (
                Self {
                    killed: killed.clone(),
                    dead: dead.clone(),
                },
                killed,
                dead,
            )
        }
    }

    impl ProcessControl for StubbornProcess {
        fn alive(&self, _pid: i32) -> Result<bool, DaemonError> {
            Ok(!self.dead.load(Ordering::SeqCst))
        }

        fn kill(&self, _pid: i32, signal: Signal) -> Result<(), Errno> {
            self.killed.lock().unwrap().push(signal);
            if signal == Signal::SIGKILL {
                self.dead.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn try_reap(&self, _pid: i32) -> Result<bool, DaemonError> {
            Ok(self.dead.load(Ordering::SeqCst))
        }
    }

    fn test_supervisor(dir: &TempDir, procs: Box<dyn ProcessControl>) -> Supervisor {
        let handle = DaemonHandle::builder(
            "stub",
            "true",
            PingSpec::command("true"),
            dir.path().join("stub.pid"),
            dir.path().join("stub.log"),
        )
        .start_abort_timeout(Duration::from_millis(200))
        .build()
        .expect("valid handle");
        Supervisor::with_process_control(handle, procs)
    }

    #[test]
    fn abort_escalates_to_sigkill_and_cleans_pid_file() {
        let dir = tempdir().expect("tempdir");
        let (procs, killed, dead) = StubbornProcess::new();
        let sup = test_supervisor(&dir, Box::new(procs));
        fs::write(dir.path().join("stub.pid"), "4242\n").expect("write pid");

        sup.abort_start(4242, true);

        assert_eq!(
            killed.lock().unwrap().as_slice(),
            &[Signal::SIGTERM, Signal::SIGKILL]
        );
        assert!(dead.load(Ordering::SeqCst));
        // The PID file named the aborted child, so it must be cleaned up.
        assert!(!dir.path().join("stub.pid").exists());
    }

    #[test]
    fn abort_of_forked_daemon_polls_liveness() {
        let dir = tempdir().expect("tempdir");
        let (procs, killed, _dead) = StubbornProcess::new();
        let sup = test_supervisor(&dir, Box::new(procs));
        fs::write(dir.path().join("stub.pid"), "4242\n").expect("write pid");

        sup.abort_start(4242, false);

        assert_eq!(
            killed.lock().unwrap().as_slice(),
            &[Signal::SIGTERM, Signal::SIGKILL]
        );
        // check_running removed the PID file once the process died.
        assert!(!dir.path().join("stub.pid").exists());
    }

    #[test]
    fn abort_leaves_pid_file_of_a_forked_daemon_alone() {
        let dir = tempdir().expect("tempdir");
        let (procs, _killed, _dead) = StubbornProcess::new();
        let sup = test_supervisor(&dir, Box::new(procs));
        // The daemon forked just before termination: the PID file names a
        // different process than the direct child being aborted.
        fs::write(dir.path().join("stub.pid"), "7777\n").expect("write pid");

        sup.abort_start(4242, true);

        assert!(dir.path().join("stub.pid").exists());
    }

    #[test]
    fn check_running_deletes_stale_pid_file() {
        struct DeadProcess;
        impl ProcessControl for DeadProcess {
            fn alive(&self, _pid: i32) -> Result<bool, DaemonError> {
                Ok(false)
            }
            fn kill(&self, _pid: i32, _signal: Signal) -> Result<(), Errno> {
                Err(Errno::ESRCH)
            }
            fn try_reap(&self, _pid: i32) -> Result<bool, DaemonError> {
                Ok(true)
            }
        }

        let dir = tempdir().expect("tempdir");
        let sup = test_supervisor(&dir, Box::new(DeadProcess));
        fs::write(dir.path().join("stub.pid"), "1234\n").expect("write pid");

        assert!(!sup.running().expect("running"));
        assert!(!dir.path().join("stub.pid").exists());
    }
}
