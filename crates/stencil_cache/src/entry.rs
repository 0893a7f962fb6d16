//! Cache entries and their metadata.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stencil_common::Timestamp;
use stencil_source::Artifact;

/// A compiled artifact together with the facts needed to judge freshness.
///
/// Entries are never patched: a recompilation replaces the whole entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The name the artifact was resolved under.
    pub name: String,
    /// The compiled artifact.
    pub artifact: Arc<Artifact>,
    /// When the entry was stored.
    pub cached_at: Timestamp,
    /// The source's `last_modified` when the artifact was compiled.
    pub source_timestamp: Timestamp,
    /// Size charged against the store's byte budget.
    pub size_bytes: u64,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(name: impl Into<String>, artifact: Arc<Artifact>, source_timestamp: Timestamp) -> Self {
        let size_bytes = artifact.size();
        Self {
            name: name.into(),
            artifact,
            cached_at: Timestamp::now(),
            source_timestamp,
            size_bytes,
        }
    }

    /// The entry's metadata without the artifact.
    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            name: self.name.clone(),
            cached_at: self.cached_at,
            source_timestamp: self.source_timestamp,
            size_bytes: self.size_bytes,
        }
    }
}

/// Metadata of a cache entry, as seen by eviction planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// The name the artifact was resolved under.
    pub name: String,
    /// When the entry was stored.
    pub cached_at: Timestamp,
    /// The source's `last_modified` when the artifact was compiled.
    pub source_timestamp: Timestamp,
    /// Size charged against the store's byte budget.
    pub size_bytes: u64,
}
