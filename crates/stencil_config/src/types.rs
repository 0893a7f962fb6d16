//! Configuration types deserialized from `stencil.toml`.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use stencil_cache::EvictionPolicy;
use stencil_source::NameStyle;

/// The top-level configuration parsed from `stencil.toml`.
///
/// Backends are listed in precedence order. A `cache` entry decorates every
/// backend listed before it.
#[derive(Debug, Default, Deserialize)]
pub struct StencilConfig {
    /// Settings shared by every backend.
    #[serde(default)]
    pub compiler: CompilerConfig,
    /// The backend hierarchy, highest precedence first.
    #[serde(default)]
    pub backends: Vec<BackendSpec>,
}

/// Settings shared by every backend.
#[derive(Debug, Default, Deserialize)]
pub struct CompilerConfig {
    /// Template suffixes used by backends that do not set their own.
    #[serde(default, deserialize_with = "deserialize_string_or_vec")]
    pub suffixes: Vec<String>,
}

/// One entry of the `backends` list, selected by its `kind` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSpec {
    /// Templates below a directory.
    Directory(DirectorySpec),
    /// Templates inside a ZIP archive.
    Archive(ArchiveSpec),
    /// Templates given inline in the configuration.
    Memory(MemorySpec),
    /// A cache over every backend listed before this one.
    Cache(CacheSpec),
}

impl BackendSpec {
    /// The `kind` tag of this entry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Directory(_) => "directory",
            Self::Archive(_) => "archive",
            Self::Memory(_) => "memory",
            Self::Cache(_) => "cache",
        }
    }
}

/// A directory backend.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySpec {
    /// Root directory. `~` is expanded; relative paths are taken from the
    /// configuration file's directory.
    pub path: PathBuf,
    /// Eligible suffixes; defaults to `compiler.suffixes`.
    #[serde(default, deserialize_with = "deserialize_opt_string_or_vec")]
    pub suffixes: Option<Vec<String>>,
    /// How names map to relative paths.
    #[serde(default)]
    pub names: NameStyleSpec,
    /// Reject names that escape the root.
    #[serde(default = "default_strict")]
    pub strict: bool,
}

/// An archive backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSpec {
    /// Path of the ZIP file.
    pub path: PathBuf,
    /// Eligible suffixes; defaults to `compiler.suffixes`.
    #[serde(default, deserialize_with = "deserialize_opt_string_or_vec")]
    pub suffixes: Option<Vec<String>>,
}

/// An in-memory backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemorySpec {
    /// Label shown in logs.
    #[serde(default)]
    pub label: Option<String>,
    /// Template text by name.
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

/// A cache decorating the backends listed before it.
///
/// Zero disables a limit.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSpec {
    /// Where entries are kept.
    #[serde(default)]
    pub store: StoreKind,
    /// Root of a `files` store.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Maximum age of an entry in seconds.
    #[serde(default)]
    pub ttl_secs: u64,
    /// Maximum number of entries.
    #[serde(default)]
    pub max_entries: usize,
    /// Maximum aggregate artifact size in bytes.
    #[serde(default)]
    pub max_bytes: u64,
    /// How long a request waits for another request's compilation.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Shard count of a `memory` store.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl CacheSpec {
    /// The eviction policy described by the limits.
    pub fn policy(&self) -> EvictionPolicy {
        let mut policy = EvictionPolicy::unbounded();
        if self.ttl_secs > 0 {
            policy = policy.with_ttl(Duration::from_secs(self.ttl_secs));
        }
        if self.max_entries > 0 {
            policy = policy.with_max_entries(self.max_entries);
        }
        if self.max_bytes > 0 {
            policy = policy.with_max_bytes(self.max_bytes);
        }
        policy
    }

    /// The single-flight wait bound.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl Default for CacheSpec {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            directory: None,
            ttl_secs: 0,
            max_entries: 0,
            max_bytes: 0,
            wait_timeout_secs: default_wait_timeout_secs(),
            shards: default_shards(),
        }
    }
}

/// Storage used by a cache backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process table; lost on exit.
    #[default]
    Memory,
    /// One file per entry below `directory`; shared between processes.
    Files,
}

/// Configured name style of a directory backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NameStyleSpec {
    /// `blog/post`
    #[default]
    Path,
    /// `blog.post`
    Dotted,
}

impl From<NameStyleSpec> for NameStyle {
    fn from(spec: NameStyleSpec) -> Self {
        match spec {
            NameStyleSpec::Path => NameStyle::Path,
            NameStyleSpec::Dotted => NameStyle::Dotted,
        }
    }
}

fn default_strict() -> bool {
    true
}

fn default_wait_timeout_secs() -> u64 {
    30
}

fn default_shards() -> usize {
    stencil_cache::store::DEFAULT_SHARDS
}

/// Deserializes a field that can be either a single string or a list of strings.
///
/// Allows `suffixes = "tpl"` as well as `suffixes = ["tpl", "html"]`.
fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec;

    impl<'de> Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut vec = Vec::new();
            while let Some(val) = seq.next_element::<String>()? {
                vec.push(val);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}

fn deserialize_opt_string_or_vec<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_string_or_vec(deserializer).map(Some)
}
