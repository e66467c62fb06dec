//! Snapshot-and-diff observation of the daemon's log file.
//!
//! The supervisor snapshots the log at the start of each start attempt.
//! While waiting for the daemon to come up, `changed` feeds the inactivity
//! watchdog, and on failure `diff` recovers whatever the daemon wrote after
//! the snapshot for the error message.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::error::DaemonError;

/// One stat observation of the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    size: u64,
    mtime: SystemTime,
}

/// Watches a daemon's log file across one start attempt.
#[derive(Debug)]
pub struct LogWatcher {
    path: PathBuf,
    origin: Option<Observation>,
    current: Option<Observation>,
}

impl LogWatcher {
    /// Captures the pre-start snapshot of the file at `path`.
    ///
    /// The snapshot is `None` when the path does not exist or is not a
    /// regular file, for instance `/dev/stderr`, a FIFO, or a character
    /// device standing in for a standard channel. Diffs are only meaningful
    /// against regular files.
    pub fn snapshot(path: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let path = path.into();
        let origin = observe(&path)?;
        if origin.is_none() {
            debug!(path = %path.display(), "log file absent or not a regular file; diffs disabled");
        }
        Ok(Self {
            path,
            origin,
            current: origin,
        })
    }

    /// Returns whether the file changed since the previous observation.
    ///
    /// A change is a different size or mtime, or the file vanishing or
    /// appearing. The observation is updated as a side effect.
    pub fn changed(&mut self) -> Result<bool, DaemonError> {
        let latest = observe(&self.path)?;
        let changed = latest != self.current;
        self.current = latest;
        Ok(changed)
    }

    /// Returns the trimmed bytes written after the initial snapshot.
    ///
    /// `None` when the snapshot was `None` or the path turned out to be
    /// unseekable (a pipe). The content is read lossily; a daemon's early
    /// output need not be valid UTF-8.
    pub fn diff(&self) -> Result<Option<String>, DaemonError> {
        let Some(origin) = self.origin else {
            return Ok(None);
        };

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        if let Err(error) = file.seek(SeekFrom::Start(origin.size)) {
            if error.raw_os_error() == Some(libc::ESPIPE) {
                return Ok(None);
            }
            return Err(error.into());
        }

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(Some(String::from_utf8_lossy(&bytes).trim().to_owned()))
    }
}

fn observe(path: &Path) -> Result<Option<Observation>, DaemonError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(Observation {
            size: meta.len(),
            mtime: meta.modified()?,
        })),
        Ok(_) => Ok(None),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Returns whether `path` resolves to a character device.
///
/// When the handle's log file is itself a standard channel (`/dev/stdout`
/// and friends), the launcher passes the child's output through instead of
/// capturing it.
pub fn is_standard_channel(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    fs::metadata(&resolved)
        .map(|meta| meta.file_type().is_char_device())
        .unwrap_or(false)
}
