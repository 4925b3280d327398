use crate::lock_manager::LockError;
use std::fmt;
use std::io;

/// Errors surfaced by the storage core. Every failure is propagated to the
/// caller; nothing is swallowed internally.
#[derive(Debug)]
pub enum StorageError {
    /// A wait-for cycle was observed while acquiring a lock; the requester
    /// is the victim and must abort via `transaction_complete(.., false)`.
    Deadlock,
    /// Every buffer slot holds a dirty page; under NO-STEAL none can be
    /// evicted. The caller cannot make progress and must abort.
    NoEvictablePage,
    /// A read or write against a table file or the log failed.
    Io(io::Error),
    /// A programming error at the core boundary, e.g. releasing a lock
    /// that is not held or reading past the end of a file.
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Deadlock => write!(f, "transaction aborted: deadlock detected"),
            StorageError::NoEvictablePage => write!(f, "buffer pool full of dirty pages"),
            StorageError::Io(err) => write!(f, "i/o error: {err}"),
            StorageError::Invariant(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<LockError> for StorageError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Deadlock => StorageError::Deadlock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_error_maps_to_deadlock() {
        let err: StorageError = LockError::Deadlock.into();
        assert!(matches!(err, StorageError::Deadlock));
    }

    #[test]
    fn io_error_is_preserved_as_source() {
        let err: StorageError = io::Error::new(io::ErrorKind::UnexpectedEof, "short read").into();
        let source = std::error::Error::source(&err).expect("io source");
        assert!(source.to_string().contains("short read"));
    }
}
