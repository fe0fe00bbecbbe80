//! Error types for the store.
//!
//! Every fallible operation returns [`Result`]. The variants form the
//! store's complete error taxonomy; callers are expected to match on them
//! (for example retrying on [`Error::Busy`] or reopening on
//! [`Error::Stale`]). Plain "key absent" lookups are reported as
//! `Ok(None)`; [`Error::NotFound`] is reserved for operations that require
//! the key to exist, such as `del`.

use std::io;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested key does not exist (or the tree is empty).
    #[error("key not found")]
    NotFound,
    /// A caller-supplied argument is invalid, or the transaction has been
    /// poisoned by an earlier structural failure.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// On-disk state failed a validation check.
    #[error("corrupted database: {0}")]
    Corrupted(String),
    /// Another process holds the writer lock on this file.
    #[error("database is locked by another writer")]
    Busy,
    /// A write was attempted through a read-only transaction or handle.
    #[error("write on read-only transaction or database")]
    ReadOnly,
    /// The file was superseded by compaction; reopen it by path.
    #[error("database file is stale, superseded by compaction")]
    Stale,
    /// An underlying file operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        Error::Corrupted(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_condition() {
        assert!(Error::NotFound.to_string().contains("not found"));
        assert!(Error::Busy.to_string().contains("locked"));
        assert!(Error::Stale.to_string().contains("stale"));
        assert!(Error::Invalid("empty key").to_string().contains("empty key"));
    }

    #[test]
    fn io_errors_convert_transparently() {
        let io = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("short read"));
    }
}
