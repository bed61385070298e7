use std::fmt;

/// Why acquiring the directory write lock failed.
///
/// Mirrors the reason categories the original flint lock implementation
/// distinguishes, so an operator can tell "another replicator is already
/// running" apart from "this filesystem doesn't support locking".
#[derive(Debug)]
pub enum LockFailure {
    /// Another process already holds the write lock.
    InUse,
    /// The filesystem backing the directory doesn't support advisory locks.
    Unsupported,
    /// Some other OS-level failure, with whatever explanation is available.
    Unknown(String),
}

impl fmt::Display for LockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockFailure::InUse => write!(f, "already locked"),
            LockFailure::Unsupported => write!(f, "locking probably not supported by this FS"),
            LockFailure::Unknown(explanation) if !explanation.is_empty() => {
                write!(f, "{explanation}")
            }
            LockFailure::Unknown(_) => write!(f, "unknown reason"),
        }
    }
}

/// A filesystem error encountered while mutating a table's on-disk files.
#[derive(Debug)]
pub struct DatabaseError {
    pub message: String,
    pub errno: Option<i32>,
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(errno) = self.errno {
            write!(f, " (errno {errno})")?;
        }
        Ok(())
    }
}

impl DatabaseError {
    pub fn new(message: impl Into<String>, source: &std::io::Error) -> Self {
        Self {
            message: message.into(),
            errno: source.raw_os_error(),
        }
    }
}

/// The error taxonomy for the changeset applier.
///
/// This is the only error type the applier's public operations return.
/// `Network` covers every malformed-input or transport-level failure
/// (including timeouts); `DatabaseLock` covers lock acquisition; `Database`
/// covers filesystem failures while mutating table files; `Unexpected`
/// covers internal invariant violations that should never happen in
/// practice.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Network(String),
    #[error("Unable to get write lock on {0}: {1}")]
    DatabaseLock(String, LockFailure),
    #[error("{0}")]
    Database(DatabaseError),
    #[error("internal error: {0}")]
    Unexpected(String),
}

impl Error {
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    pub fn database_lock(dir: impl Into<String>, reason: LockFailure) -> Self {
        Error::DatabaseLock(dir.into(), reason)
    }

    pub fn database(message: impl Into<String>, source: &std::io::Error) -> Self {
        Error::Database(DatabaseError::new(message, source))
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        Error::Unexpected(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
