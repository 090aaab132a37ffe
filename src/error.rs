//! Error types for Temporal-KV

use thiserror::Error;

/// Result type alias for Temporal-KV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Operation name used when a snapshot write fails after the log append succeeded.
pub const OP_UPSERT_PERSIST_SNAPSHOT: &str = "upsert.persist_snapshot";

/// Main error type for Temporal-KV
#[derive(Error, Debug)]
pub enum Error {
    /// Storage could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed frame found while scanning the history log
    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    /// Snapshot encoding or decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An error annotated with the store operation and key it came from
    #[error("{operation} failed for key {key:?}: {source}")]
    Context {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<Error>,
    },
}

/// The kind of failure, independent of any context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IoFailure,
    CorruptRecord,
    Serialization,
    Configuration,
}

impl Error {
    /// Wrap an error with the operation and key that produced it.
    pub fn context(self, operation: &'static str, key: &str) -> Self {
        Error::Context {
            operation,
            key: key.to_string(),
            source: Box::new(self),
        }
    }

    /// Kind of the innermost error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::IoFailure,
            Error::CorruptRecord { .. } => ErrorKind::CorruptRecord,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// True when an upsert failed after its record was durably appended.
    ///
    /// The write is in the history log and will be visible to `travel`, `diff`
    /// and to the current-state table after the next rebuild.
    pub fn is_logged_but_not_snapshotted(&self) -> bool {
        matches!(
            self,
            Error::Context { operation, .. } if *operation == OP_UPSERT_PERSIST_SNAPSHOT
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Configuration(e.to_string())
    }
}
