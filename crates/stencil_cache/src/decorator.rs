//! The cache decorator: a container that serves compiled artifacts from a
//! cache store and compiles each stale name at most once at a time.

use std::sync::Arc;
use std::time::Duration;

use stencil_common::Timestamp;
use stencil_source::{Artifact, CacheStatus, Compiler, Container, Origin, Source, SourceError};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::flight::{FlightGroup, Joined, Landing};
use crate::policy::Probe;
use crate::store::{CacheStore, SweepReport};

/// How long a caller waits for another caller's compilation by default.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one compilation, tagged with the modification time of the
/// source version it was compiled from.
type Compiled = (Timestamp, Result<Arc<Artifact>, SourceError>);

/// Wraps a container with a cache of compiled artifacts.
///
/// Every resolution looks the name up in the wrapped container to learn the
/// source's current modification time; the cached artifact is served only
/// if it was compiled from that exact version and is within the TTL.
/// Otherwise one caller compiles and stores the artifact while concurrent
/// callers for the same name wait for its result. Compile errors reach
/// every waiting caller and are never stored.
///
/// The decorator is itself a [`Container`] whose sources are precompiled,
/// so it can be nested anywhere in a hierarchy.
pub struct CachedContainer<C> {
    label: String,
    inner: C,
    store: Arc<dyn CacheStore>,
    compiler: Arc<dyn Compiler>,
    flights: FlightGroup<Compiled>,
    wait_timeout: Duration,
}

impl<C: Container> CachedContainer<C> {
    /// Decorates `inner`, caching artifacts produced by `compiler` in `store`.
    pub fn new(inner: C, store: Arc<dyn CacheStore>, compiler: Arc<dyn Compiler>) -> Self {
        Self {
            label: format!("cache:{}", inner.label()),
            inner,
            store,
            compiler,
            flights: FlightGroup::new(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Bounds how long a caller waits for a concurrent compilation.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Overrides the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// The wrapped container.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// The cache store.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// The compiler used on a miss.
    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    /// Resolves `name` to a compiled artifact.
    ///
    /// Returns `Ok(None)` if the wrapped container no longer has the name;
    /// any cache entry for it is dropped.
    pub fn resolve(&self, name: &str) -> Result<Option<Arc<Artifact>>, SourceError> {
        Ok(self.resolve_source(name)?.map(|(_, artifact)| artifact))
    }

    /// Loads `name` into the cache if it is not already fresh there.
    /// Returns whether the name exists.
    pub fn fetch(&self, name: &str) -> Result<bool, SourceError> {
        Ok(self.resolve_source(name)?.is_some())
    }

    /// Whether a fresh artifact for `name` is cached.
    pub fn is_cached(&self, name: &str) -> Result<bool, SourceError> {
        let Some(source) = self.inner.lookup(name)? else {
            return Ok(false);
        };
        match self.store.get(name) {
            Ok(Some(entry)) => Ok(self.store.policy().is_fresh(
                &entry.meta(),
                source.last_modified(),
                Timestamp::now(),
            )),
            Ok(None) | Err(CacheError::Corrupt { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the wrapped container that have a fresh cached artifact.
    pub fn cached_names(&self) -> Result<Vec<String>, SourceError> {
        let mut cached = Vec::new();
        for name in self.inner.names()? {
            if self.is_cached(&name)? {
                cached.push(name);
            }
        }
        Ok(cached)
    }

    /// Drops the cached artifact for `name`. Returns whether one was cached.
    pub fn invalidate(&self, name: &str) -> Result<bool, SourceError> {
        Ok(self.store.remove(name)?)
    }

    /// Drops every cached artifact, including those of cached containers
    /// nested inside the wrapped one.
    pub fn clear(&self) -> Result<usize, SourceError> {
        let mut removed = self.store.clear()?;
        if let CacheStatus::Cleared { removed: nested } = self.inner.clear_cache() {
            removed += nested;
        }
        info!(container = %self.label, removed, "cleared cache");
        Ok(removed)
    }

    /// Applies the store's eviction policy against the wrapped container's
    /// current state.
    pub fn sweep(&self) -> Result<SweepReport, SourceError> {
        let probe = |name: &str| match self.inner.lookup(name) {
            Ok(Some(source)) => Probe::Current(source.last_modified()),
            Ok(None) => Probe::Missing,
            Err(e) => {
                debug!(name, error = %e, "cannot probe source during sweep");
                Probe::Unknown
            }
        };
        let report = self.store.sweep(&probe)?;
        info!(
            container = %self.label,
            expired = report.expired,
            evicted = report.evicted,
            remaining = report.remaining,
            "swept cache"
        );
        Ok(report)
    }

    fn resolve_source(&self, name: &str) -> Result<Option<(Source, Arc<Artifact>)>, SourceError> {
        let Some(mut source) = self.inner.lookup(name)? else {
            if self.store.remove(name)? {
                debug!(name, "source vanished; dropped cache entry");
            }
            return Ok(None);
        };
        loop {
            if let Some(artifact) = self.cached(&source)? {
                debug!(name, "cache hit");
                return Ok(Some((source, artifact)));
            }
            match self.flights.join(name) {
                Joined::Leader(leader) => {
                    let compiled = match self.cached(&source) {
                        Ok(Some(artifact)) => Ok(artifact),
                        Ok(None) => self.compile_and_store(&source),
                        Err(e) => Err(e),
                    };
                    leader.complete((source.last_modified(), compiled.clone()));
                    return compiled.map(|artifact| Some((source, artifact)));
                }
                Joined::Follower(follower) => match follower.wait(self.wait_timeout) {
                    Landing::Finished((compiled_from, compiled)) => {
                        if compiled_from == source.last_modified() {
                            return compiled.map(|artifact| Some((source, artifact)));
                        }
                        debug!(name, "joined a compilation of another version; looking up again");
                        match self.inner.lookup(name)? {
                            Some(current) => source = current,
                            None => {
                                self.store.remove(name)?;
                                return Ok(None);
                            }
                        }
                    }
                    Landing::Abandoned => {
                        debug!(name, "compilation abandoned; retrying");
                    }
                    Landing::TimedOut => {
                        warn!(name, waited = ?self.wait_timeout, "timed out waiting for compilation");
                        return Err(SourceError::Timeout {
                            name: name.to_string(),
                            waited: self.wait_timeout,
                        });
                    }
                },
            }
        }
    }

    /// Returns the cached artifact if it is fresh for `source`.
    ///
    /// A corrupt entry is removed and reported as a miss.
    fn cached(&self, source: &Source) -> Result<Option<Arc<Artifact>>, SourceError> {
        let name = source.name();
        match self.store.get(name) {
            Ok(Some(entry)) => {
                let fresh = self.store.policy().is_fresh(
                    &entry.meta(),
                    source.last_modified(),
                    Timestamp::now(),
                );
                Ok(fresh.then_some(entry.artifact))
            }
            Ok(None) => Ok(None),
            Err(CacheError::Corrupt { reason, .. }) => {
                warn!(name, %reason, "removing corrupt cache entry");
                self.store.remove(name)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn compile_and_store(&self, source: &Source) -> Result<Arc<Artifact>, SourceError> {
        let name = source.name();
        debug!(name, compiler = self.compiler.id(), "compiling");
        let artifact = source.load(self.compiler.as_ref())?;
        if let Err(e) = self
            .store
            .put(name, Arc::clone(&artifact), source.last_modified())
        {
            warn!(name, error = %e, "failed to store compiled artifact");
        }
        Ok(artifact)
    }
}

impl<C: Container> Container for CachedContainer<C> {
    fn label(&self) -> &str {
        &self.label
    }

    fn lookup(&self, name: &str) -> Result<Option<Source>, SourceError> {
        Ok(self.resolve_source(name)?.map(|(source, artifact)| {
            Source::compiled(
                name,
                source.last_modified(),
                Origin::Cache(self.label.clone()),
                artifact,
            )
        }))
    }

    fn contains(&self, name: &str) -> Result<bool, SourceError> {
        self.inner.contains(name)
    }

    fn names(&self) -> Result<Vec<String>, SourceError> {
        self.inner.names()
    }

    fn close(&self) -> Result<(), SourceError> {
        self.inner.close()
    }

    fn is_cacheable(&self) -> bool {
        true
    }

    fn clear_cache(&self) -> CacheStatus {
        match self.clear() {
            Ok(removed) => CacheStatus::Cleared { removed },
            Err(e) => CacheStatus::Failed(e.to_string()),
        }
    }

    fn sweep_cache(&self) -> CacheStatus {
        let mut status = match self.sweep() {
            Ok(report) => CacheStatus::Cleared {
                removed: report.removed(),
            },
            Err(e) => return CacheStatus::Failed(e.to_string()),
        };
        if let (CacheStatus::Cleared { removed }, CacheStatus::Cleared { removed: nested }) =
            (&mut status, self.inner.sweep_cache())
        {
            *removed += nested;
        }
        status
    }
}
