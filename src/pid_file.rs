//! The daemon's PID file: written by the daemon, read and recovered here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::DaemonError;

/// Read/validate/delete access to a daemon's PID file.
///
/// The file is owned by the daemon; the supervisor only deletes it when it
/// has confirmed the recorded process is gone, or while recovering from an
/// aborted start.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates a handle for the PID file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the PID file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the recorded PID.
    ///
    /// A missing file yields `None`. A file whose trimmed content is not a
    /// bare decimal integer (including an empty file) is *invalid* and also
    /// yields `None`. Other I/O errors propagate.
    pub fn read(&self) -> Result<Option<i32>, DaemonError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let trimmed = content.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            debug!(path = %self.path.display(), "PID file exists but is invalid");
            return Ok(None);
        }

        Ok(trimmed.parse::<i32>().ok())
    }

    /// Returns whether the file exists with non-zero size.
    pub fn available(&self) -> bool {
        fs::metadata(&self.path).map(|meta| meta.len() > 0).unwrap_or(false)
    }

    /// Deletes the file, best-effort.
    ///
    /// `ENOENT` and permission errors are tolerated silently; anything else
    /// is logged and otherwise ignored.
    pub fn delete(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "deleted PID file"),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) => {}
            Err(error) => {
                warn!(path = %self.path.display(), %error, "failed to delete PID file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn pid_file_in(dir: &Path) -> PidFile {
        PidFile::new(dir.join("daemon.pid"))
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir().expect("tempdir");
        let pid_file = pid_file_in(dir.path());
        assert_eq!(pid_file.read().expect("read"), None);
        assert!(!pid_file.available());
    }

    #[test]
    fn whitespace_wrapped_pid_parses() {
        let dir = tempdir().expect("tempdir");
        let pid_file = pid_file_in(dir.path());
        fs::write(pid_file.path(), "  1234\n").expect("write");
        assert_eq!(pid_file.read().expect("read"), Some(1234));
        assert!(pid_file.available());
    }

    #[test]
    fn empty_file_is_invalid() {
        let dir = tempdir().expect("tempdir");
        let pid_file = pid_file_in(dir.path());
        fs::write(pid_file.path(), "").expect("write");
        assert_eq!(pid_file.read().expect("read"), None);
        assert!(!pid_file.available());
    }

    #[test]
    fn non_numeric_content_is_invalid() {
        let dir = tempdir().expect("tempdir");
        let pid_file = pid_file_in(dir.path());
        fs::write(pid_file.path(), "not-a-pid\n").expect("write");
        assert_eq!(pid_file.read().expect("read"), None);
        // A garbage file still counts as present for the start loop.
        assert!(pid_file.available());
    }

    #[test]
    fn signed_or_mixed_content_is_invalid() {
        let dir = tempdir().expect("tempdir");
        let pid_file = pid_file_in(dir.path());
        fs::write(pid_file.path(), "-42\n").expect("write");
        assert_eq!(pid_file.read().expect("read"), None);
        fs::write(pid_file.path(), "12 34\n").expect("write");
        assert_eq!(pid_file.read().expect("read"), None);
    }

    #[test]
    fn delete_tolerates_missing_file() {
        let dir = tempdir().expect("tempdir");
        let pid_file = pid_file_in(dir.path());
        pid_file.delete();

        fs::write(pid_file.path(), "99\n").expect("write");
        pid_file.delete();
        assert!(!pid_file.path().exists());
    }
}
