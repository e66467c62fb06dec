//! The liveness probe: answers "is the daemon connectable right now?".

use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::trace;

use crate::error::DaemonError;

/// Bound on a single TCP or Unix connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Outcome of one probe invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The daemon answered.
    Up,
    /// The daemon is not connectable yet.
    Down,
}

/// How to probe the daemon for liveness.
pub enum PingSpec {
    /// Run `sh -c <command>`; exit status 0 means up.
    Command(String),
    /// Connect to a TCP endpoint.
    Tcp {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Connect to an `AF_UNIX` stream socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },
    /// An arbitrary synchronous check.
    ///
    /// `Ok(true)` is up, `Ok(false)` is down, and a connect-pending error
    /// (`ECONNREFUSED`, `ENETUNREACH`, `ETIMEDOUT`, `ECONNRESET`, `EINVAL`,
    /// `EADDRNOTAVAIL`, or a missing socket file) is down as well. Other
    /// errors propagate. Any connection the callable opens should be
    /// dropped inside it; `Drop` swallows close errors, preserving the
    /// probe's fire-and-forget contract. Callers who need the connection
    /// itself should use `Supervisor::connect` instead.
    Callable(Box<dyn Fn() -> io::Result<bool> + Send + Sync>),
}

impl PingSpec {
    /// Shorthand for [`PingSpec::Command`].
    pub fn command(command: impl Into<String>) -> Self {
        PingSpec::Command(command.into())
    }

    /// Shorthand for [`PingSpec::Tcp`].
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        PingSpec::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Shorthand for [`PingSpec::Unix`].
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        PingSpec::Unix { path: path.into() }
    }

    /// Shorthand for [`PingSpec::Callable`].
    pub fn callable(probe: impl Fn() -> io::Result<bool> + Send + Sync + 'static) -> Self {
        PingSpec::Callable(Box::new(probe))
    }

    /// Performs one synchronous probe.
    pub fn check(&self) -> Result<ProbeStatus, DaemonError> {
        let status = match self {
            PingSpec::Command(command) => {
                let status = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()?;
                if status.success() {
                    ProbeStatus::Up
                } else {
                    ProbeStatus::Down
                }
            }
            PingSpec::Tcp { host, port } => probe_tcp(host, *port)?,
            PingSpec::Unix { path } => probe_unix(path)?,
            PingSpec::Callable(probe) => match probe() {
                Ok(true) => ProbeStatus::Up,
                Ok(false) => ProbeStatus::Down,
                Err(error) if is_connect_pending(&error) => ProbeStatus::Down,
                Err(error) => return Err(error.into()),
            },
        };
        trace!(?status, "probe finished");
        Ok(status)
    }
}

impl fmt::Debug for PingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingSpec::Command(command) => f.debug_tuple("Command").field(command).finish(),
            PingSpec::Tcp { host, port } => f
                .debug_struct("Tcp")
                .field("host", host)
                .field("port", port)
                .finish(),
            PingSpec::Unix { path } => f.debug_struct("Unix").field("path", path).finish(),
            PingSpec::Callable(_) => f
                .debug_tuple("Callable")
                .field(&"Fn() -> io::Result<bool>")
                .finish(),
        }
    }
}

/// Connects to every address the host resolves to, both families, so a
/// v4-only or v6-only daemon is found without a dedicated `EAFNOSUPPORT`
/// retry. A non-pending error on any address propagates immediately; a
/// pending error on a later address must not mask it.
fn probe_tcp(host: &str, port: u16) -> Result<ProbeStatus, DaemonError> {
    let addrs = (host, port).to_socket_addrs()?;
    let mut resolved_any = false;

    for addr in addrs {
        resolved_any = true;
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(_) => return Ok(ProbeStatus::Up),
            Err(error) if is_connect_pending(&error) => {}
            Err(error) => return Err(error.into()),
        }
    }

    if resolved_any {
        Ok(ProbeStatus::Down)
    } else {
        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address resolved for {host}:{port}"),
        )
        .into())
    }
}

fn probe_unix(path: &std::path::Path) -> Result<ProbeStatus, DaemonError> {
    let connect = || -> io::Result<()> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        let addr = SockAddr::unix(path)?;
        socket.connect_timeout(&addr, CONNECT_TIMEOUT)
    };

    match connect() {
        Ok(()) => Ok(ProbeStatus::Up),
        Err(error) if is_connect_pending(&error) => Ok(ProbeStatus::Down),
        Err(error) => Err(error.into()),
    }
}

/// Returns whether `error` means "nothing is accepting connections yet".
///
/// This is the error set a probe may legitimately see while the daemon is
/// still booting; everything outside it indicates a broken probe or a
/// misconfigured environment. `EINVAL` is included because some platforms
/// report it for a concurrent connect. A missing Unix socket file arrives
/// as `ENOENT`.
pub(crate) fn is_connect_pending(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable
    ) {
        return true;
    }
    matches!(
        error.raw_os_error(),
        Some(
            libc::ECONNREFUSED
                | libc::ENETUNREACH
                | libc::ETIMEDOUT
                | libc::ECONNRESET
                | libc::EINVAL
                | libc::EADDRNOTAVAIL
                | libc::ENOENT
        )
    )
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::os::unix::net::UnixListener;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn tcp_probe_tracks_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();

        let spec = PingSpec::tcp("127.0.0.1", port);
        assert_eq!(spec.check().expect("probe up"), ProbeStatus::Up);

        drop(listener);
        assert_eq!(spec.check().expect("probe down"), ProbeStatus::Down);
    }

    #[test]
    fn unix_probe_tracks_listener() {
        let dir = tempdir().expect("tempdir");
        let socket_path = dir.path().join("daemon.sock");

        let spec = PingSpec::unix(&socket_path);
        // Socket file not created yet.
        assert_eq!(spec.check().expect("probe down"), ProbeStatus::Down);

        let listener = UnixListener::bind(&socket_path).expect("bind listener");
        assert_eq!(spec.check().expect("probe up"), ProbeStatus::Up);

        drop(listener);
        std::fs::remove_file(&socket_path).expect("remove socket");
        assert_eq!(spec.check().expect("probe down"), ProbeStatus::Down);
    }

    #[test]
    fn command_probe_maps_exit_status() {
        assert_eq!(
            PingSpec::command("true").check().expect("probe"),
            ProbeStatus::Up
        );
        assert_eq!(
            PingSpec::command("false").check().expect("probe"),
            ProbeStatus::Down
        );
    }

    #[test]
    fn callable_probe_maps_pending_errors_to_down() {
        let spec = PingSpec::callable(|| {
            Err(io::Error::from_raw_os_error(libc::ECONNREFUSED))
        });
        assert_eq!(spec.check().expect("probe"), ProbeStatus::Down);
    }

    #[test]
    fn callable_probe_propagates_foreign_errors() {
        let spec = PingSpec::callable(|| {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
        });
        assert!(spec.check().is_err());
    }

    #[test]
    fn callable_probe_returns_value() {
        assert_eq!(
            PingSpec::callable(|| Ok(true)).check().expect("probe"),
            ProbeStatus::Up
        );
        assert_eq!(
            PingSpec::callable(|| Ok(false)).check().expect("probe"),
            ProbeStatus::Down
        );
    }
}
