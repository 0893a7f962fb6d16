//! In-process cache store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use stencil_common::{key_hash, Timestamp};
use stencil_source::Artifact;

use super::{enforce_budget, sweep_entries, CacheStore, SweepReport};
use crate::entry::{CacheEntry, EntryMeta};
use crate::error::CacheError;
use crate::policy::{EvictionPolicy, Probe};

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

type Shard = RwLock<HashMap<String, CacheEntry>>;

/// A cache store kept in process memory.
///
/// Entries are spread over a power-of-two number of shards by key hash, so
/// unrelated names rarely share a lock. Entry count and aggregate size are
/// tracked atomically and never require a full scan.
pub struct MemoryStore {
    shards: Box<[Shard]>,
    mask: usize,
    count: AtomicUsize,
    bytes: AtomicU64,
    policy: EvictionPolicy,
    maintenance: Mutex<()>,
}

impl MemoryStore {
    /// Creates a store with [`DEFAULT_SHARDS`] shards.
    pub fn new(policy: EvictionPolicy) -> Self {
        Self::with_shards(DEFAULT_SHARDS, policy)
    }

    /// Creates a store with at least `shards` shards, rounded up to a power
    /// of two.
    pub fn with_shards(shards: usize, policy: EvictionPolicy) -> Self {
        let n = shards.max(1).next_power_of_two();
        Self {
            shards: (0..n).map(|_| RwLock::new(HashMap::new())).collect(),
            mask: n - 1,
            count: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            policy,
            maintenance: Mutex::new(()),
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, name: &str) -> &Shard {
        &self.shards[key_hash(name) as usize & self.mask]
    }

    fn account_removed(&self, entry: &CacheEntry) {
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
    }
}

impl CacheStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn get(&self, name: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.shard(name).read().get(name).cloned())
    }

    fn put(
        &self,
        name: &str,
        artifact: Arc<Artifact>,
        source_timestamp: Timestamp,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry::new(name, artifact, source_timestamp);
        {
            let mut shard = self.shard(name).write();
            self.bytes.fetch_add(entry.size_bytes, Ordering::Relaxed);
            match shard.insert(name.to_string(), entry.clone()) {
                Some(old) => {
                    self.bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
                }
                None => {
                    self.count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let count = self.count.load(Ordering::Relaxed);
        if self.policy.is_over(count, self.bytes.load(Ordering::Relaxed)) {
            let _guard = self.maintenance.lock();
            enforce_budget(self)?;
        }
        Ok(entry)
    }

    fn remove(&self, name: &str) -> Result<bool, CacheError> {
        let mut shard = self.shard(name).write();
        let removed = shard.remove(name);
        if let Some(entry) = &removed {
            self.account_removed(entry);
        }
        Ok(removed.is_some())
    }

    fn remove_if(&self, name: &str, cached_at: Timestamp) -> Result<bool, CacheError> {
        let mut shard = self.shard(name).write();
        if shard.get(name).map(|e| e.cached_at) != Some(cached_at) {
            return Ok(false);
        }
        if let Some(entry) = shard.remove(name) {
            self.account_removed(&entry);
        }
        Ok(true)
    }

    fn entries(&self) -> Result<Vec<EntryMeta>, CacheError> {
        let mut metas = Vec::with_capacity(self.count.load(Ordering::Relaxed));
        for shard in self.shards.iter() {
            metas.extend(shard.read().values().map(CacheEntry::meta));
        }
        Ok(metas)
    }

    fn clear(&self) -> Result<usize, CacheError> {
        let _guard = self.maintenance.lock();
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            for (_, entry) in shard.drain() {
                self.account_removed(&entry);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.count.load(Ordering::Relaxed))
    }

    fn total_bytes(&self) -> Result<u64, CacheError> {
        Ok(self.bytes.load(Ordering::Relaxed))
    }

    fn sweep(&self, probe: &dyn Fn(&str) -> Probe) -> Result<SweepReport, CacheError> {
        let _guard = self.maintenance.lock();
        sweep_entries(self, probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn artifact(name: &str, body: &str) -> Arc<Artifact> {
        Arc::new(Artifact::new(name, body.as_bytes(), "plain/1", body.as_bytes().to_vec()))
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_nanos(n)
    }

    #[test]
    fn put_then_get() {
        let store = MemoryStore::new(EvictionPolicy::unbounded());
        let stored = store.put("a", artifact("a", "X"), ts(1)).unwrap();
        let got = store.get("a").unwrap().unwrap();
        assert_eq!(got, stored);
        assert_eq!(got.source_timestamp, ts(1));
        assert!(store.get("b").unwrap().is_none());
    }

    #[test]
    fn replace_keeps_accounting_exact() {
        let store = MemoryStore::new(EvictionPolicy::unbounded());
        store.put("a", artifact("a", "short"), ts(1)).unwrap();
        let second = store.put("a", artifact("a", "a much longer body"), ts(2)).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.total_bytes().unwrap(), second.size_bytes);
        assert_eq!(store.get("a").unwrap().unwrap().source_timestamp, ts(2));
    }

    #[test]
    fn shard_count_is_power_of_two() {
        assert_eq!(MemoryStore::with_shards(0, EvictionPolicy::unbounded()).shard_count(), 1);
        assert_eq!(MemoryStore::with_shards(5, EvictionPolicy::unbounded()).shard_count(), 8);
        assert_eq!(MemoryStore::with_shards(16, EvictionPolicy::unbounded()).shard_count(), 16);
    }

    #[test]
    fn bounded_store_evicts_oldest_on_put() {
        let store = MemoryStore::new(EvictionPolicy::unbounded().with_max_entries(2));
        store.put("first", artifact("first", "1"), ts(1)).unwrap();
        store.put("second", artifact("second", "2"), ts(1)).unwrap();
        store.put("third", artifact("third", "3"), ts(1)).unwrap();
        assert!(store.get("first").unwrap().is_none());
        assert!(store.get("second").unwrap().is_some());
        assert!(store.get("third").unwrap().is_some());
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn byte_budget_holds_after_put() {
        let store = MemoryStore::new(EvictionPolicy::unbounded().with_max_bytes(100));
        for i in 0..20 {
            let name = format!("entry{i}");
            store.put(&name, artifact(&name, "0123456789"), ts(1)).unwrap();
            assert!(store.total_bytes().unwrap() <= 100);
        }
    }

    #[test]
    fn remove_if_ignores_replaced_entries() {
        let store = MemoryStore::new(EvictionPolicy::unbounded());
        let old = store.put("a", artifact("a", "X"), ts(1)).unwrap();
        let new = store.put("a", artifact("a", "Y"), ts(2)).unwrap();
        assert!(!store.remove_if("a", old.cached_at).unwrap());
        assert!(store.remove_if("a", new.cached_at).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn sweep_removes_stale_and_keeps_fresh() {
        let store = MemoryStore::new(EvictionPolicy::unbounded());
        store.put("changed", artifact("changed", "X"), ts(1)).unwrap();
        store.put("gone", artifact("gone", "X"), ts(1)).unwrap();
        store.put("same", artifact("same", "X"), ts(1)).unwrap();
        let report = store
            .sweep(&|name: &str| match name {
                "changed" => Probe::Current(ts(2)),
                "gone" => Probe::Missing,
                _ => Probe::Current(ts(1)),
            })
            .unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(report.evicted, 0);
        assert_eq!(report.remaining, 1);
        assert!(store.get("same").unwrap().is_some());
    }

    #[test]
    fn sweep_applies_ttl() {
        let policy = EvictionPolicy::unbounded().with_ttl(Duration::from_millis(20));
        let store = MemoryStore::new(policy);
        store.put("a", artifact("a", "X"), ts(1)).unwrap();
        thread::sleep(Duration::from_millis(40));
        let report = store.sweep(&|_: &str| Probe::Current(ts(1))).unwrap();
        assert_eq!(report.expired, 1);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn clear_is_complete_and_idempotent() {
        let store = MemoryStore::new(EvictionPolicy::unbounded());
        for name in ["a", "b", "c"] {
            store.put(name, artifact(name, "X"), ts(1)).unwrap();
        }
        assert_eq!(store.clear().unwrap(), 3);
        assert_eq!(store.clear().unwrap(), 0);
        assert_eq!(store.len().unwrap(), 0);
        assert_eq!(store.total_bytes().unwrap(), 0);
    }

    #[test]
    fn concurrent_puts_on_distinct_keys() {
        let store = Arc::new(MemoryStore::with_shards(4, EvictionPolicy::unbounded()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        let name = format!("t{t}-{i}");
                        store.put(&name, artifact(&name, "X"), ts(1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len().unwrap(), 400);
        assert_eq!(store.entries().unwrap().len(), 400);
    }
}
