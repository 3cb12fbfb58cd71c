//! Unified error type for every public API boundary.
//!
//! Failures are explicit result values; the library never panics on bad
//! input or bad state. Configuration and state violations are fatal for the
//! call that raised them, storage failures propagate with context, and
//! recoverable conditions (a candidate without a forward record) are handled
//! locally with a `tracing::warn!` rather than surfacing here.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failures surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or mismatched configuration (bad nlist, indivisible dims,
    /// merge between differently-trained indexes, writes on a read-only
    /// handle). Fatal for the operation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation requires a trained index.
    #[error("operation requires a trained index")]
    NotTrained,

    /// Re-training a trained index is not supported.
    #[error("index is already trained")]
    AlreadyTrained,

    /// A required file or record is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Failure inside the KV engine.
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    /// File-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted bytes that do not parse: short keys, inconsistent token
    /// counts, unknown format tags.
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}

// redb reports distinct error types per operation; fold them all into the
// storage variant so `?` works at every call site.
impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Corrupt(e.to_string())
    }
}
