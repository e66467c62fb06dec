//! Advisory file locking shared by every supervisor of one daemon identity.
//!
//! Locks are taken with `flock(2)` on a descriptor opened fresh for each
//! acquisition. `flock` locks belong to the open file description, so two
//! acquisitions inside one process contend exactly like two separate
//! processes; no additional in-process mutex layer is needed. The guard
//! releases the lock on drop, which covers every exit path including
//! panics. Rust opens the descriptor with `O_CLOEXEC`, so the lock is never
//! leaked into spawned daemons.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

use crate::error::DaemonError;

/// A named lock file supporting scoped shared and exclusive acquisition.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Creates a handle for the lock at `path`; the file is created lazily.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `body` while holding a shared lock.
    ///
    /// Blocks until the lock is granted. Multiple shared holders may run
    /// concurrently; none may overlap an exclusive holder.
    pub fn with_shared<T>(
        &self,
        body: impl FnOnce() -> Result<T, DaemonError>,
    ) -> Result<T, DaemonError> {
        let guard = self.acquire(FlockArg::LockShared)?;
        trace!(path = %self.path.display(), "acquired shared lock");
        let result = body();
        drop(guard);
        result
    }

    /// Runs `body` while holding the exclusive lock.
    ///
    /// Blocks until every other holder, shared or exclusive, has released.
    /// Do not nest exclusive acquisitions of the same lock file within one
    /// call chain; the second acquisition would deadlock against the first.
    pub fn with_exclusive<T>(
        &self,
        body: impl FnOnce() -> Result<T, DaemonError>,
    ) -> Result<T, DaemonError> {
        let guard = self.acquire(FlockArg::LockExclusive)?;
        trace!(path = %self.path.display(), "acquired exclusive lock");
        let result = body();
        drop(guard);
        result
    }

    fn acquire(&self, mode: FlockArg) -> Result<Flock<File>, DaemonError> {
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            match Flock::lock(file, mode) {
                Ok(guard) => return Ok(guard),
                Err((_, Errno::EINTR)) => continue,
                Err((_, errno)) => return Err(io::Error::from(errno).into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn exclusive_lock_excludes_other_threads() {
        let dir = tempdir().expect("tempdir");
        let lock = LockFile::new(dir.path().join("daemon.pid.lock"));
        let held = Arc::new(AtomicBool::new(false));

        let holder = {
            let lock = lock.clone();
            let held = held.clone();
            thread::spawn(move || {
                lock.with_exclusive(|| {
                    held.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(300));
                    held.store(false, Ordering::SeqCst);
                    Ok(())
                })
                .expect("exclusive holder");
            })
        };

        // Give the holder time to take the lock before contending.
        while !held.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }

        lock.with_shared(|| {
            assert!(
                !held.load(Ordering::SeqCst),
                "shared lock granted while exclusive lock was held"
            );
            Ok(())
        })
        .expect("shared acquisition");

        holder.join().expect("holder thread");
    }

    #[test]
    fn shared_locks_run_concurrently() {
        let dir = tempdir().expect("tempdir");
        let lock = LockFile::new(dir.path().join("daemon.pid.lock"));

        lock.with_shared(|| {
            // A second shared acquisition must not block behind the first.
            let lock = lock.clone();
            let second = thread::spawn(move || lock.with_shared(|| Ok(())));
            second.join().expect("second shared thread")
        })
        .expect("nested shared locks");
    }

    #[test]
    fn lock_released_after_body_error() {
        let dir = tempdir().expect("tempdir");
        let lock = LockFile::new(dir.path().join("daemon.pid.lock"));

        let result: Result<(), DaemonError> = lock.with_exclusive(|| {
            Err(DaemonError::InvalidConfig("boom".into()))
        });
        assert!(result.is_err());

        // The failed body must not leave the lock held.
        lock.with_exclusive(|| Ok(())).expect("reacquire");
    }
}
