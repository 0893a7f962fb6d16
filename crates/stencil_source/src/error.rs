//! Error types for source lookup, reading, and compilation.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::artifact::CompileError;

/// Errors raised while resolving a name to a compiled artifact.
///
/// A missing name is not an error: lookups report absence as `Ok(None)`.
/// This type is `Clone` so one failure can be handed to every caller that
/// was waiting on the same compilation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The underlying storage could not be read (permissions, vanished mount).
    #[error("cannot access {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: Arc<io::Error>,
    },

    /// An archive could not be opened or one of its entries could not be read.
    #[error("archive {path} is unreadable: {reason}")]
    Archive {
        /// The archive file.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The name was rejected before touching storage, e.g. it would leave
    /// the container's root directory.
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The container was closed before or during the operation.
    #[error("container '{0}' is closed")]
    Closed(String),

    /// The raw text failed to compile.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Waiting for another caller's compilation of the same name took too long.
    #[error("timed out after {waited:?} waiting for '{name}' to compile")]
    Timeout {
        /// The name being compiled.
        name: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The cache layer failed in a way that is not self-healing.
    #[error("cache failure: {0}")]
    Cache(Arc<dyn std::error::Error + Send + Sync>),
}

/// Coarse classification used by callers to pick a response behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Storage unreachable, misconfigured, or closed.
    Unavailable,
    /// The script exists but failed to compile.
    CompileFailed,
    /// A transient condition; the same call may succeed later.
    Retryable,
}

impl SourceError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Compile(_) => ErrorKind::CompileFailed,
            Self::Timeout { .. } => ErrorKind::Retryable,
            Self::Io { .. }
            | Self::Archive { .. }
            | Self::InvalidName { .. }
            | Self::Closed(_)
            | Self::Cache(_) => ErrorKind::Unavailable,
        }
    }
}
