//! The container contract shared by every storage backend.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use regex::Regex;

use crate::error::SourceError;
use crate::source::Source;

/// Lazy sequence of sources produced by enumerating a container.
pub type Sources<'a> = Box<dyn Iterator<Item = Result<Source, SourceError>> + 'a>;

/// Outcome of a cache management request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// The operation ran; `removed` entries were dropped.
    Cleared {
        /// Number of entries removed.
        removed: usize,
    },
    /// The backend has no cache to manage.
    NotACache,
    /// The operation failed.
    Failed(String),
}

/// A mapping from names to [`Source`]s.
///
/// Lookups of an unchanged name are idempotent: they return sources that
/// compare equal. Absence is `Ok(None)`; errors mean the storage could not
/// be consulted and must not be mistaken for absence.
pub trait Container: Send + Sync {
    /// Identity used in logs and for ordering inside a hierarchy.
    fn label(&self) -> &str;

    /// Looks up a single name.
    fn lookup(&self, name: &str) -> Result<Option<Source>, SourceError>;

    /// Returns whether `name` resolves to a source.
    fn contains(&self, name: &str) -> Result<bool, SourceError> {
        Ok(self.lookup(name)?.is_some())
    }

    /// Lists every name currently present. Finite; each call starts over.
    fn names(&self) -> Result<Vec<String>, SourceError>;

    /// Enumerates all sources lazily.
    ///
    /// Names that disappear between listing and lookup are skipped.
    fn sources(&self) -> Result<Sources<'_>, SourceError> {
        let names = self.names()?;
        Ok(Box::new(
            names
                .into_iter()
                .filter_map(move |name| self.lookup(&name).transpose()),
        ))
    }

    /// Enumerates the sources whose name matches `pattern` anywhere.
    fn search<'a>(&'a self, pattern: &'a Regex) -> Result<Sources<'a>, SourceError> {
        let names = self.names()?;
        Ok(Box::new(
            names
                .into_iter()
                .filter(move |name| pattern.is_match(name))
                .filter_map(move |name| self.lookup(&name).transpose()),
        ))
    }

    /// Releases underlying resources. Waits for in-flight lookups; a second
    /// call is a no-op.
    fn close(&self) -> Result<(), SourceError>;

    /// Whether this container (or something it wraps) caches artifacts.
    fn is_cacheable(&self) -> bool {
        false
    }

    /// Drops every cached artifact.
    fn clear_cache(&self) -> CacheStatus {
        CacheStatus::NotACache
    }

    /// Drops stale or over-budget cached artifacts.
    fn sweep_cache(&self) -> CacheStatus {
        CacheStatus::NotACache
    }
}

macro_rules! delegate_container {
    ($wrapper:ident) => {
        impl<C: Container + ?Sized> Container for $wrapper<C> {
            fn label(&self) -> &str {
                (**self).label()
            }
            fn lookup(&self, name: &str) -> Result<Option<Source>, SourceError> {
                (**self).lookup(name)
            }
            fn contains(&self, name: &str) -> Result<bool, SourceError> {
                (**self).contains(name)
            }
            fn names(&self) -> Result<Vec<String>, SourceError> {
                (**self).names()
            }
            fn sources(&self) -> Result<Sources<'_>, SourceError> {
                (**self).sources()
            }
            fn search<'a>(&'a self, pattern: &'a Regex) -> Result<Sources<'a>, SourceError> {
                (**self).search(pattern)
            }
            fn close(&self) -> Result<(), SourceError> {
                (**self).close()
            }
            fn is_cacheable(&self) -> bool {
                (**self).is_cacheable()
            }
            fn clear_cache(&self) -> CacheStatus {
                (**self).clear_cache()
            }
            fn sweep_cache(&self) -> CacheStatus {
                (**self).sweep_cache()
            }
        }
    };
}

delegate_container!(Box);
delegate_container!(Arc);

/// Close-versus-use exclusion for a container and the sources it issued.
///
/// Every lookup and every read through an issued source holds a [`Pass`];
/// [`Gate::close`] waits until no pass is outstanding and then refuses new
/// ones, so underlying handles are never released under a reader.
pub struct Gate {
    label: String,
    closed: RwLock<bool>,
}

/// Proof that the gate was open when the operation started.
pub struct Pass<'a> {
    _guard: RwLockReadGuard<'a, bool>,
}

impl Gate {
    /// Creates an open gate for the container labelled `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            closed: RwLock::new(false),
        }
    }

    /// Enters the gate, failing if it has been closed.
    pub fn enter(&self) -> Result<Pass<'_>, SourceError> {
        let guard = self.closed.read();
        if *guard {
            return Err(SourceError::Closed(self.label.clone()));
        }
        Ok(Pass { _guard: guard })
    }

    /// Closes the gate. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut closed = self.closed.write();
        !std::mem::replace(&mut *closed, true)
    }

    /// Label of the container the gate guards.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the gate has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }
}
