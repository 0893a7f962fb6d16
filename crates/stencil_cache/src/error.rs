//! Error types for cache store operations.

use std::path::PathBuf;
use std::sync::Arc;

use stencil_source::SourceError;

/// Errors that can occur during cache store operations.
///
/// Only [`CacheError::Corrupt`] is self-healing: the decorator removes the
/// entry and recompiles. Every other variant reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A cache entry has an invalid header, a wrong format version, or a
    /// payload that does not match its checksum.
    #[error("corrupt cache entry '{name}': {reason}")]
    Corrupt {
        /// The entry's name, or the file name when the name is unreadable.
        name: String,
        /// Description of the problem.
        reason: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<CacheError> for SourceError {
    fn from(err: CacheError) -> Self {
        SourceError::Cache(Arc::new(err))
    }
}
