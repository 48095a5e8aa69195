//! Per-scope lock files.
//!
//! A scheduling invocation holds its scope's lock for the whole
//! read-decide-commit sequence. The lock is a `create_new` file so it works
//! across unrelated processes on the same state directory; it is removed on
//! drop, covering every exit path including errors.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

use super::StateError;

/// Poll interval while waiting for a contended lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Exclusive lock on one scope's rotation state.
#[derive(Debug)]
pub struct ScopeLock {
    path: PathBuf,
}

impl ScopeLock {
    /// Acquire the lock, waiting up to `timeout` before giving up with a
    /// retryable [`StateError::Conflict`].
    pub(crate) fn acquire(
        path: PathBuf,
        scope: &str,
        timeout: Duration,
    ) -> Result<Self, StateError> {
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Holder pid, for operators inspecting a stuck lock.
                    let _ = write!(file, "{}", std::process::id());
                    debug!(scope, "acquired rotation lock");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(StateError::Conflict {
                            scope: scope.to_string(),
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(err) => return Err(StateError::Persistence(err)),
            }
        }
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), %err, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host-unicorn.lock");

        let lock = ScopeLock::acquire(path.clone(), "host:unicorn", Duration::ZERO).unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_contended_lock_times_out_as_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host-unicorn.lock");

        let _held = ScopeLock::acquire(path.clone(), "host:unicorn", Duration::ZERO).unwrap();
        let err = ScopeLock::acquire(path, "host:unicorn", Duration::from_millis(60)).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
    }

    #[test]
    fn test_lock_reacquirable_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("class-kvm.lock");

        drop(ScopeLock::acquire(path.clone(), "class:kvm", Duration::ZERO).unwrap());
        assert!(ScopeLock::acquire(path, "class:kvm", Duration::ZERO).is_ok());
    }
}
