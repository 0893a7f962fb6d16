//! Eviction policy: deciding which cache entries are stale or over budget.
//!
//! The policy is a pure function of entry metadata, the current time, and
//! what the backend currently reports for each name. Stores apply the plan;
//! the policy never touches storage itself.

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stencil_common::Timestamp;

use crate::entry::EntryMeta;

/// What the backend currently reports for a cached name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The source exists with this modification time.
    Current(Timestamp),
    /// The source no longer exists.
    Missing,
    /// The backend could not be consulted; the entry is left alone.
    Unknown,
}

/// Time-to-live and size budget for a cache store.
///
/// `None` disables the corresponding trigger. With no TTL only a change of
/// the source invalidates an entry; with no size bounds the store grows
/// without limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionPolicy {
    /// Maximum age of an entry, measured from when it was cached.
    pub ttl: Option<Duration>,
    /// Maximum number of entries.
    pub max_entries: Option<usize>,
    /// Maximum aggregate size in bytes.
    pub max_bytes: Option<u64>,
}

/// Entries selected for removal by [`EvictionPolicy::plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Entries whose source changed or vanished, or whose TTL elapsed.
    pub expired: Vec<EntryMeta>,
    /// Fresh entries removed, oldest first, to get back under budget.
    pub evicted: Vec<EntryMeta>,
}

impl EvictionPlan {
    /// Whether the plan removes nothing.
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.evicted.is_empty()
    }
}

impl EvictionPolicy {
    /// A policy with every trigger disabled.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Sets the time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Sets the maximum aggregate size in bytes.
    pub fn with_max_bytes(mut self, max: u64) -> Self {
        self.max_bytes = Some(max);
        self
    }

    /// Whether any size trigger is configured.
    pub fn is_bounded(&self) -> bool {
        self.max_entries.is_some() || self.max_bytes.is_some()
    }

    /// Whether `entry` has outlived the TTL at `now`.
    pub fn is_expired(&self, entry: &EntryMeta, now: Timestamp) -> bool {
        self.ttl
            .is_some_and(|ttl| now.elapsed_since(entry.cached_at) > ttl)
    }

    /// Whether `entry` may be served for a source last modified at
    /// `source_modified`.
    pub fn is_fresh(&self, entry: &EntryMeta, source_modified: Timestamp, now: Timestamp) -> bool {
        entry.source_timestamp == source_modified && !self.is_expired(entry, now)
    }

    /// Whether `count` entries totalling `bytes` exceed the budget.
    pub fn is_over(&self, count: usize, bytes: u64) -> bool {
        self.max_entries.is_some_and(|max| count > max)
            || self.max_bytes.is_some_and(|max| bytes > max)
    }

    /// Plans a sweep over `entries`.
    ///
    /// The time pass runs first: entries whose source changed or vanished,
    /// or whose TTL elapsed, are expired. The size pass then evicts the
    /// oldest-cached survivors, ties broken by name, until the remainder fits
    /// the budget.
    pub fn plan<F>(&self, entries: &[EntryMeta], now: Timestamp, probe: F) -> EvictionPlan
    where
        F: Fn(&str) -> Probe,
    {
        let mut plan = EvictionPlan::default();
        let mut survivors = Vec::with_capacity(entries.len());
        for entry in entries {
            let stale = match probe(&entry.name) {
                Probe::Current(modified) => !self.is_fresh(entry, modified, now),
                Probe::Missing => true,
                Probe::Unknown => self.is_expired(entry, now),
            };
            if stale {
                plan.expired.push(entry.clone());
            } else {
                survivors.push(entry.clone());
            }
        }
        plan.evicted = self.overflow(survivors);
        plan
    }

    /// Selects the oldest-cached entries to drop so the rest fit the budget.
    pub fn overflow(&self, mut entries: Vec<EntryMeta>) -> Vec<EntryMeta> {
        if !self.is_bounded() {
            return Vec::new();
        }
        let mut count = entries.len();
        let mut bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if !self.is_over(count, bytes) {
            return Vec::new();
        }
        entries.sort_by(oldest_first);
        let mut evicted = Vec::new();
        for entry in entries {
            if !self.is_over(count, bytes) {
                break;
            }
            count -= 1;
            bytes = bytes.saturating_sub(entry.size_bytes);
            evicted.push(entry);
        }
        evicted
    }
}

fn oldest_first(a: &EntryMeta, b: &EntryMeta) -> Ordering {
    a.cached_at
        .cmp(&b.cached_at)
        .then_with(|| a.name.cmp(&b.name))
}
