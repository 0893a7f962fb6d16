//! Construction of the backend hierarchy described by a configuration.

use std::sync::Arc;

use regex::Regex;
use stencil_cache::{CacheStore, CachedContainer, FileStore, MemoryStore};
use stencil_source::{
    Archive, CacheStatus, Chain, Compiler, Container, Directory, MemoryContainer, Source,
    SourceError, Sources,
};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::types::{BackendSpec, CacheSpec, CompilerConfig, StencilConfig, StoreKind};

/// A cache decorating part of the hierarchy.
pub type CachedBackend = CachedContainer<Box<Backend>>;

/// One node of a configured backend hierarchy.
pub enum Backend {
    /// Files below a directory.
    Directory(Directory),
    /// Entries of a ZIP archive.
    Archive(Archive),
    /// Inline templates.
    Memory(MemoryContainer),
    /// Several backends queried in order.
    Chain(Chain<Backend>),
    /// A cache over a sub-hierarchy.
    Cached(CachedBackend),
}

impl Backend {
    fn as_container(&self) -> &dyn Container {
        match self {
            Self::Directory(c) => c,
            Self::Archive(c) => c,
            Self::Memory(c) => c,
            Self::Chain(c) => c,
            Self::Cached(c) => c,
        }
    }

    /// Short name of this node's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Directory(_) => "directory",
            Self::Archive(_) => "archive",
            Self::Memory(_) => "memory",
            Self::Chain(_) => "chain",
            Self::Cached(_) => "cache",
        }
    }

    /// Every cache in this hierarchy, outermost first.
    pub fn caches(&self) -> Vec<&CachedBackend> {
        let mut out = Vec::new();
        self.collect_caches(&mut out);
        out
    }

    fn collect_caches<'a>(&'a self, out: &mut Vec<&'a CachedBackend>) {
        match self {
            Self::Cached(cached) => {
                out.push(cached);
                cached.inner().collect_caches(out);
            }
            Self::Chain(chain) => {
                for member in chain.members() {
                    member.collect_caches(out);
                }
            }
            Self::Directory(_) | Self::Archive(_) | Self::Memory(_) => {}
        }
    }
}

impl Container for Backend {
    fn label(&self) -> &str {
        self.as_container().label()
    }

    fn lookup(&self, name: &str) -> Result<Option<Source>, SourceError> {
        self.as_container().lookup(name)
    }

    fn contains(&self, name: &str) -> Result<bool, SourceError> {
        self.as_container().contains(name)
    }

    fn names(&self) -> Result<Vec<String>, SourceError> {
        self.as_container().names()
    }

    fn sources(&self) -> Result<Sources<'_>, SourceError> {
        self.as_container().sources()
    }

    fn search<'a>(&'a self, pattern: &'a Regex) -> Result<Sources<'a>, SourceError> {
        self.as_container().search(pattern)
    }

    fn close(&self) -> Result<(), SourceError> {
        self.as_container().close()
    }

    fn is_cacheable(&self) -> bool {
        self.as_container().is_cacheable()
    }

    fn clear_cache(&self) -> CacheStatus {
        self.as_container().clear_cache()
    }

    fn sweep_cache(&self) -> CacheStatus {
        self.as_container().sweep_cache()
    }
}

/// Builds the backend hierarchy of `config`.
///
/// Non-cache backends accumulate into a chain in declaration order. A cache
/// entry wraps everything accumulated so far and becomes the first member of
/// the continuing chain. A hierarchy of one member is returned unwrapped.
pub fn build_backend(
    config: &StencilConfig,
    compiler: Arc<dyn Compiler>,
) -> Result<Backend, ConfigError> {
    let mut members: Vec<Backend> = Vec::new();
    for (index, spec) in config.backends.iter().enumerate() {
        let backend = match spec {
            BackendSpec::Cache(cache) => {
                let inner = collapse(std::mem::take(&mut members)).ok_or_else(|| {
                    ConfigError::ValidationError(format!(
                        "backends[{index}]: a cache must follow the backends it decorates"
                    ))
                })?;
                let store = open_store(index, cache)?;
                info!(
                    index,
                    store = store.kind(),
                    decorates = inner.label(),
                    "cache configured"
                );
                Backend::Cached(
                    CachedContainer::new(Box::new(inner), store, Arc::clone(&compiler))
                        .with_wait_timeout(cache.wait_timeout()),
                )
            }
            other => open_container(index, other, &config.compiler)?,
        };
        debug!(index, kind = backend.kind(), label = backend.label(), "backend ready");
        members.push(backend);
    }
    collapse(members).ok_or_else(|| ConfigError::MissingField("backends".to_string()))
}

fn collapse(mut members: Vec<Backend>) -> Option<Backend> {
    match members.len() {
        0 => None,
        1 => members.pop(),
        _ => Some(Backend::Chain(Chain::new("chain", members))),
    }
}

fn open_container(
    index: usize,
    spec: &BackendSpec,
    compiler: &CompilerConfig,
) -> Result<Backend, ConfigError> {
    let failed = |reason: String| ConfigError::Backend {
        index,
        kind: spec.kind(),
        reason,
    };
    let suffixes = |own: &Option<Vec<String>>| own.clone().unwrap_or_else(|| compiler.suffixes.clone());
    match spec {
        BackendSpec::Directory(dir) => {
            if !dir.path.is_dir() {
                return Err(failed(format!("{} is not a directory", dir.path.display())));
            }
            Ok(Backend::Directory(
                Directory::new(&dir.path)
                    .with_suffixes(suffixes(&dir.suffixes))
                    .with_name_style(dir.names.into())
                    .strict(dir.strict),
            ))
        }
        BackendSpec::Archive(archive) => {
            let opened = Archive::open(&archive.path).map_err(|e| failed(e.to_string()))?;
            Ok(Backend::Archive(opened.with_suffixes(suffixes(&archive.suffixes))))
        }
        BackendSpec::Memory(memory) => {
            let label = memory.label.clone().unwrap_or_else(|| format!("memory:{index}"));
            let container = MemoryContainer::new(label);
            for (name, text) in &memory.scripts {
                container.insert(name.as_str(), text);
            }
            Ok(Backend::Memory(container))
        }
        BackendSpec::Cache(_) => Err(failed("a cache is not a container".to_string())),
    }
}

fn open_store(index: usize, spec: &CacheSpec) -> Result<Arc<dyn CacheStore>, ConfigError> {
    let policy = spec.policy();
    match spec.store {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::with_shards(spec.shards, policy))),
        StoreKind::Files => {
            let directory = spec
                .directory
                .as_ref()
                .ok_or_else(|| ConfigError::MissingField(format!("backends[{index}].directory")))?;
            let store = FileStore::open(directory, policy).map_err(|e| ConfigError::Backend {
                index,
                kind: "cache",
                reason: e.to_string(),
            })?;
            Ok(Arc::new(store))
        }
    }
}
