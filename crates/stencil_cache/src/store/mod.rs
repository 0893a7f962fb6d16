//! Cache store contract and its implementations.
//!
//! A store persists `name -> CacheEntry` and knows its own
//! [`EvictionPolicy`]. It does not judge freshness on `get`: that needs the
//! live source, which only the decorator has.

mod files;
mod memory;

use std::sync::Arc;

use stencil_common::Timestamp;
use stencil_source::Artifact;
use tracing::debug;

use crate::entry::{CacheEntry, EntryMeta};
use crate::error::CacheError;
use crate::policy::{EvictionPolicy, Probe};

pub use files::FileStore;
pub use memory::{MemoryStore, DEFAULT_SHARDS};

/// Outcome of a [`CacheStore::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed because their source changed or their TTL elapsed.
    pub expired: usize,
    /// Entries removed to get back under the size budget.
    pub evicted: usize,
    /// Entries left after the sweep.
    pub remaining: usize,
    /// Aggregate size left after the sweep.
    pub total_bytes: u64,
}

impl SweepReport {
    /// Total number of entries removed.
    pub fn removed(&self) -> usize {
        self.expired + self.evicted
    }
}

/// Persistent or in-process storage for cache entries.
///
/// Operations on different names never contend on a common lock.
/// Maintenance (`sweep`, `clear`, size enforcement) is serialised per store
/// and removes an entry only if it is still the one that was planned for
/// removal, so a concurrent `put` of a fresh artifact is never lost.
pub trait CacheStore: Send + Sync {
    /// Short identifier of the storage kind, for status output.
    fn kind(&self) -> &'static str;

    /// Returns the entry stored under `name`, fresh or not.
    ///
    /// Fails with [`CacheError::Corrupt`] when the stored bytes are
    /// unusable; callers are expected to remove the entry and recompile.
    fn get(&self, name: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Stores `artifact` under `name`, replacing any previous entry, then
    /// enforces the size budget.
    fn put(
        &self,
        name: &str,
        artifact: Arc<Artifact>,
        source_timestamp: Timestamp,
    ) -> Result<CacheEntry, CacheError>;

    /// Removes `name`, returning whether an entry was present.
    fn remove(&self, name: &str) -> Result<bool, CacheError>;

    /// Removes `name` only if its entry was cached at `cached_at`.
    fn remove_if(&self, name: &str, cached_at: Timestamp) -> Result<bool, CacheError>;

    /// Metadata of every stored entry.
    fn entries(&self) -> Result<Vec<EntryMeta>, CacheError>;

    /// Removes every entry and returns how many were removed.
    ///
    /// Idempotent: re-running a clear that was interrupted finishes it.
    fn clear(&self) -> Result<usize, CacheError>;

    /// The eviction policy this store enforces.
    fn policy(&self) -> &EvictionPolicy;

    /// Number of stored entries.
    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries()?.len())
    }

    /// Whether the store holds no entries.
    fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Aggregate size of the stored entries.
    fn total_bytes(&self) -> Result<u64, CacheError> {
        Ok(self.entries()?.iter().map(|e| e.size_bytes).sum())
    }

    /// Applies the eviction policy, asking `probe` for each entry's source.
    fn sweep(&self, probe: &dyn Fn(&str) -> Probe) -> Result<SweepReport, CacheError> {
        sweep_entries(self, probe)
    }
}

/// Plans a sweep over the current entries and applies it.
///
/// Callers serialise maintenance themselves; this only guarantees that an
/// entry replaced since it was listed survives.
pub(crate) fn sweep_entries<S>(
    store: &S,
    probe: &dyn Fn(&str) -> Probe,
) -> Result<SweepReport, CacheError>
where
    S: CacheStore + ?Sized,
{
    let entries = store.entries()?;
    let plan = store.policy().plan(&entries, Timestamp::now(), probe);
    let mut report = SweepReport::default();
    for meta in &plan.expired {
        if store.remove_if(&meta.name, meta.cached_at)? {
            debug!(name = %meta.name, "expired cache entry");
            report.expired += 1;
        }
    }
    for meta in &plan.evicted {
        if store.remove_if(&meta.name, meta.cached_at)? {
            debug!(name = %meta.name, "evicted cache entry");
            report.evicted += 1;
        }
    }
    let remaining = store.entries()?;
    report.remaining = remaining.len();
    report.total_bytes = remaining.iter().map(|e| e.size_bytes).sum();
    Ok(report)
}

/// Drops the oldest entries until the store fits its size budget.
pub(crate) fn enforce_budget<S>(store: &S) -> Result<usize, CacheError>
where
    S: CacheStore + ?Sized,
{
    let mut evicted = 0;
    for meta in store.policy().overflow(store.entries()?) {
        if store.remove_if(&meta.name, meta.cached_at)? {
            debug!(name = %meta.name, "evicted cache entry over budget");
            evicted += 1;
        }
    }
    Ok(evicted)
}
