//! Parsing of `stencil.toml` and construction of the backend hierarchy it
//! describes.
//!
//! [`load_config`] reads a file found by [`locate_config`] into a
//! [`StencilConfig`]; [`build_backend`] turns its `backends` list into a
//! [`Backend`], the closed set of container kinds a deployment can use.

#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod loader;
pub mod types;

pub use backend::{build_backend, Backend, CachedBackend};
pub use error::ConfigError;
pub use loader::{expand_tilde, load_config, load_config_from_str, locate_config, CONFIG_ENV};
pub use types::*;
