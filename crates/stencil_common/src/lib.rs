//! Shared foundational types used across the Stencil template engine.
//!
//! This crate provides content hashing for integrity checks and the
//! nanosecond [`Timestamp`] used for staleness decisions throughout the
//! source and cache layers.

#![warn(missing_docs)]

pub mod hash;
pub mod timestamp;

pub use hash::{key_hash, ContentHash};
pub use timestamp::Timestamp;
