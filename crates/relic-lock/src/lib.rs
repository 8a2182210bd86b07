//! # relic-lock
//!
//! Two flavours of mutual exclusion over registry paths, sharing one
//! poll-until-deadline shape:
//!
//! - [`PathLockRegistry`]: in-process marks keyed by logical path, guarded by
//!   a single mutex and polled every [`PATH_LOCK_POLL`].
//! - [`FileLock`]: an exclusive `flock` on a dedicated lock file, retried
//!   every [`FILE_LOCK_POLL`] so other processes are excluded as well.
//!
//! Either must be held around read-modify-write sequences on shared
//! per-project state (manifest, usage, latest pointer).

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Backoff between attempts on a process-local path lock
pub const PATH_LOCK_POLL: Duration = Duration::from_millis(50);

/// Backoff between attempts on an advisory file lock
pub const FILE_LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for lock on {path}")]
    Timeout { path: String, timeout: Duration },

    #[error("I/O error on lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// In-process lock marks over logical paths.
#[derive(Debug, Default)]
pub struct PathLockRegistry {
    locked: Mutex<HashSet<String>>,
}

impl PathLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as locked, polling until it is free or `timeout` elapses.
    pub fn lock_path(&self, path: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
                if locked.insert(path.to_string()) {
                    debug!(path, "Path lock acquired");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    path: path.to_string(),
                    timeout,
                });
            }
            thread::sleep(PATH_LOCK_POLL);
        }
    }

    /// Clear the mark on `path`, whether or not it was set.
    pub fn unlock_path(&self, path: &str) {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        locked.remove(path);
        debug!(path, "Path lock released");
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    /// Lock `path` and release it when the guard drops.
    pub fn guard<'a>(&'a self, path: &str, timeout: Duration) -> Result<PathLockGuard<'a>> {
        self.lock_path(path, timeout)?;
        Ok(PathLockGuard {
            registry: self,
            path: path.to_string(),
        })
    }
}

/// Releases a [`PathLockRegistry`] mark on drop.
#[derive(Debug)]
pub struct PathLockGuard<'a> {
    registry: &'a PathLockRegistry,
    path: String,
}

impl Drop for PathLockGuard<'_> {
    fn drop(&mut self) {
        self.registry.unlock_path(&self.path);
    }
}

/// Exclusive advisory lock on a lock file.
///
/// The lock is held until the value is dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock on `path`, creating the file if needed.
    pub fn acquire<P: AsRef<Path>>(path: P, timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(source) => return Err(LockError::Io { path, source }),
        };

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %path.display(), "File lock acquired");
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_contended(&e) => {
                    if start.elapsed() >= timeout {
                        return Err(LockError::Timeout {
                            path: path.display().to_string(),
                            timeout,
                        });
                    }
                    thread::sleep(FILE_LOCK_POLL);
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_path_lock_excludes_until_unlocked() {
        let registry = PathLockRegistry::new();
        registry.lock_path("pokemon", Duration::from_secs(1)).unwrap();

        let err = registry
            .lock_path("pokemon", Duration::from_millis(120))
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        // Independent paths do not contend.
        registry.lock_path("digimon", Duration::from_millis(10)).unwrap();

        registry.unlock_path("pokemon");
        registry.lock_path("pokemon", Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_path_lock_waits_for_release() {
        let registry = Arc::new(PathLockRegistry::new());
        registry.lock_path("p", Duration::from_secs(1)).unwrap();

        let other = Arc::clone(&registry);
        let waiter = thread::spawn(move || other.lock_path("p", Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(150));
        registry.unlock_path("p");

        waiter.join().unwrap().unwrap();
        assert!(registry.is_locked("p"));
    }

    #[test]
    fn test_path_lock_guard_releases_on_drop() {
        let registry = PathLockRegistry::new();
        {
            let _guard = registry.guard("p", Duration::from_secs(1)).unwrap();
            assert!(registry.is_locked("p"));
        }
        assert!(!registry.is_locked("p"));
    }

    #[test]
    fn test_file_lock_timeout_and_release() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("..LOCK");

        let held = FileLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();
        assert_eq!(held.path(), lock_path.as_path());

        let err = FileLock::acquire(&lock_path, Duration::from_millis(250)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        drop(held);
        FileLock::acquire(&lock_path, Duration::from_millis(250)).unwrap();
    }
}
