//! Caching of compiled scripts.
//!
//! This crate provides the [`CachedContainer`] decorator, which serves
//! compiled artifacts from a [`CacheStore`] and recompiles a script only when
//! its source changed or its entry expired. Concurrent requests for the same
//! stale script share one compilation through a [`FlightGroup`]. Stores
//! enforce an [`EvictionPolicy`] combining a time-to-live with a size budget.
//!
//! [`ScriptHost`] ties a backend to an [`Executor`] and is the entry point
//! for serving requests.

#![warn(missing_docs)]

pub mod decorator;
pub mod entry;
pub mod error;
pub mod flight;
pub mod host;
pub mod policy;
pub mod store;

pub use decorator::{CachedContainer, DEFAULT_WAIT_TIMEOUT};
pub use entry::{CacheEntry, EntryMeta};
pub use error::CacheError;
pub use flight::{FlightGroup, Joined, Landing};
pub use host::{Env, ExecuteError, Executor, PlainExecutor, ResolveError, ResolveKind, ScriptHost};
pub use policy::{EvictionPlan, EvictionPolicy, Probe};
pub use store::{CacheStore, FileStore, MemoryStore, SweepReport};
