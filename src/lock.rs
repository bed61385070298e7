//! Directory lock (C3).
//!
//! Acquires a mutually exclusive advisory lock on the database directory
//! for the duration of one applier session. The lock is taken on a
//! dedicated `flintlock` file inside the directory (never the directory
//! itself, which may be read by query paths concurrently) and released
//! automatically when the guard is dropped.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, LockFailure, Result};

const LOCK_FILE_NAME: &str = "flintlock";

/// An exclusive lock on a database directory, held for the lifetime of the
/// guard. Dropping the guard releases the lock.
pub struct DirectoryLock {
    file: File,
    dir: PathBuf,
}

impl DirectoryLock {
    /// Acquire the write lock on `dir`. Only `exclusive = true` is ever
    /// used by the applier; the flag exists to document that shared locks
    /// are a valid extension point, not a supported mode here.
    pub fn acquire(dir: &Path, exclusive: bool) -> Result<Self> {
        debug_assert!(exclusive, "the applier only ever takes exclusive locks");

        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to open lock file");
                Error::database_lock(dir.display().to_string(), classify_open_failure(&e))
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), "acquired write lock");
                Ok(Self {
                    file,
                    dir: dir.to_path_buf(),
                })
            }
            Err(e) => {
                let reason = classify_lock_failure(&e);
                tracing::warn!(dir = %dir.display(), reason = %reason, "failed to acquire write lock");
                Err(Error::database_lock(dir.display().to_string(), reason))
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn classify_lock_failure(e: &io::Error) -> LockFailure {
    match e.kind() {
        io::ErrorKind::WouldBlock => LockFailure::InUse,
        _ => match e.raw_os_error() {
            Some(errno) if is_unsupported(errno) => LockFailure::Unsupported,
            _ => LockFailure::Unknown(e.to_string()),
        },
    }
}

fn classify_open_failure(e: &io::Error) -> LockFailure {
    LockFailure::Unknown(e.to_string())
}

#[cfg(unix)]
fn is_unsupported(errno: i32) -> bool {
    errno == libc::ENOLCK || errno == libc::ENOTSUP || errno == libc::EOPNOTSUPP
}

#[cfg(not(unix))]
fn is_unsupported(_errno: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_exclusive_lock_fails_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let _first = DirectoryLock::acquire(dir.path(), true).unwrap();
        let second = DirectoryLock::acquire(dir.path(), true);
        match second {
            Err(Error::DatabaseLock(_, LockFailure::InUse)) => {}
            other => panic!("expected InUse, got {other:?}"),
        }
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _guard = DirectoryLock::acquire(dir.path(), true).unwrap();
        }
        DirectoryLock::acquire(dir.path(), true).unwrap();
    }
}
