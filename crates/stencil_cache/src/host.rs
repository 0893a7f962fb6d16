//! Entry point for the serving layer: resolve a name and execute it.

use std::collections::BTreeMap;
use std::sync::Arc;

use stencil_source::{Artifact, CacheStatus, Compiler, Container, ErrorKind, SourceError};
use tracing::debug;

/// Variables handed to a script execution.
pub type Env = BTreeMap<String, String>;

/// A script failed while executing.
#[derive(Debug, Clone, thiserror::Error)]
#[error("execution of '{name}' failed: {reason}")]
pub struct ExecuteError {
    /// The script that failed.
    pub name: String,
    /// Description of the failure.
    pub reason: String,
}

/// Runs compiled artifacts.
pub trait Executor: Send + Sync {
    /// Executes `artifact` with `env` and returns its output.
    fn execute(&self, artifact: &Artifact, env: &Env) -> Result<Vec<u8>, ExecuteError>;
}

/// Executor for artifacts whose code is the output itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainExecutor;

impl Executor for PlainExecutor {
    fn execute(&self, artifact: &Artifact, _env: &Env) -> Result<Vec<u8>, ExecuteError> {
        Ok(artifact.code.clone())
    }
}

/// Why a name could not be resolved and executed.
///
/// The variants let callers tell "does not exist" from "exists but does not
/// compile" from "backend unavailable" via [`ResolveError::kind`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// No configured container has the name.
    #[error("script '{name}' not found")]
    NotFound {
        /// The name that was requested.
        name: String,
    },

    /// Lookup, compilation, or the cache failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The artifact failed while running.
    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

/// Classification of a [`ResolveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveKind {
    /// The script does not exist.
    NotFound,
    /// The script exists but failed to compile.
    CompileFailed,
    /// Storage is unreachable, misconfigured, or closed.
    Unavailable,
    /// A transient condition; retrying may succeed.
    Retryable,
    /// The script compiled but failed while running.
    ExecutionFailed,
}

impl ResolveError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ResolveKind {
        match self {
            Self::NotFound { .. } => ResolveKind::NotFound,
            Self::Source(e) => match e.kind() {
                ErrorKind::CompileFailed => ResolveKind::CompileFailed,
                ErrorKind::Retryable => ResolveKind::Retryable,
                ErrorKind::Unavailable => ResolveKind::Unavailable,
            },
            Self::Execute(_) => ResolveKind::ExecutionFailed,
        }
    }
}

/// Owns a backend and serves scripts from it.
///
/// Backends that cache hand out precompiled sources; for the rest the host
/// compiles on every request with its own compiler.
pub struct ScriptHost<C, E> {
    backend: C,
    compiler: Arc<dyn Compiler>,
    executor: E,
}

impl<C: Container, E: Executor> ScriptHost<C, E> {
    /// Creates a host over `backend`.
    pub fn new(backend: C, compiler: Arc<dyn Compiler>, executor: E) -> Self {
        Self {
            backend,
            compiler,
            executor,
        }
    }

    /// The backend scripts are resolved from.
    pub fn backend(&self) -> &C {
        &self.backend
    }

    /// Resolves `name` to a compiled artifact.
    pub fn resolve(&self, name: &str) -> Result<Arc<Artifact>, ResolveError> {
        let source = self
            .backend
            .lookup(name)?
            .ok_or_else(|| ResolveError::NotFound {
                name: name.to_string(),
            })?;
        Ok(source.load(self.compiler.as_ref())?)
    }

    /// Resolves `name` and executes it with `env`.
    pub fn resolve_and_execute(&self, name: &str, env: &Env) -> Result<Vec<u8>, ResolveError> {
        let artifact = self.resolve(name)?;
        debug!(name, compiler = %artifact.compiler, "executing");
        Ok(self.executor.execute(&artifact, env)?)
    }

    /// Whether the backend caches artifacts.
    pub fn is_cacheable(&self) -> bool {
        self.backend.is_cacheable()
    }

    /// Drops every cached artifact.
    pub fn clear_cache(&self) -> CacheStatus {
        self.backend.clear_cache()
    }

    /// Drops stale and over-budget cached artifacts.
    pub fn sweep_cache(&self) -> CacheStatus {
        self.backend.sweep_cache()
    }

    /// Closes the backend.
    pub fn close(&self) -> Result<(), SourceError> {
        self.backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decorator::CachedContainer;
    use crate::policy::EvictionPolicy;
    use crate::store::MemoryStore;
    use stencil_common::Timestamp;
    use stencil_source::{MemoryContainer, PlainCompiler};

    struct Failing;

    impl Executor for Failing {
        fn execute(&self, artifact: &Artifact, _env: &Env) -> Result<Vec<u8>, ExecuteError> {
            Err(ExecuteError {
                name: artifact.name.clone(),
                reason: "boom".to_string(),
            })
        }
    }

    fn memory() -> MemoryContainer {
        let mem = MemoryContainer::new("mem");
        mem.insert_at("hello", "Hello, world", Timestamp::from_nanos(1));
        mem.insert_at("broken", [0xC3u8, 0x28], Timestamp::from_nanos(1));
        mem
    }

    #[test]
    fn executes_resolved_script() {
        let host = ScriptHost::new(memory(), Arc::new(PlainCompiler), PlainExecutor);
        let out = host.resolve_and_execute("hello", &Env::new()).unwrap();
        assert_eq!(out, b"Hello, world");
        assert!(!host.is_cacheable());
        assert_eq!(host.clear_cache(), CacheStatus::NotACache);
    }

    #[test]
    fn errors_are_classified() {
        let host = ScriptHost::new(memory(), Arc::new(PlainCompiler), PlainExecutor);
        let env = Env::new();
        assert_eq!(
            host.resolve_and_execute("missing", &env).unwrap_err().kind(),
            ResolveKind::NotFound
        );
        assert_eq!(
            host.resolve_and_execute("broken", &env).unwrap_err().kind(),
            ResolveKind::CompileFailed
        );
        host.close().unwrap();
        assert_eq!(
            host.resolve_and_execute("hello", &env).unwrap_err().kind(),
            ResolveKind::Unavailable
        );
    }

    #[test]
    fn execution_failure_is_distinct() {
        let host = ScriptHost::new(memory(), Arc::new(PlainCompiler), Failing);
        let err = host.resolve_and_execute("hello", &Env::new()).unwrap_err();
        assert_eq!(err.kind(), ResolveKind::ExecutionFailed);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn cached_backend_reports_management() {
        let compiler: Arc<dyn Compiler> = Arc::new(PlainCompiler);
        let backend = CachedContainer::new(
            memory(),
            Arc::new(MemoryStore::new(EvictionPolicy::unbounded())),
            Arc::clone(&compiler),
        );
        let host = ScriptHost::new(backend, compiler, PlainExecutor);
        host.resolve_and_execute("hello", &Env::new()).unwrap();
        assert!(host.is_cacheable());
        assert_eq!(host.sweep_cache(), CacheStatus::Cleared { removed: 0 });
        assert_eq!(host.clear_cache(), CacheStatus::Cleared { removed: 1 });
    }
}
