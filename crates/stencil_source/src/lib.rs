//! Script sources and the containers that hold them.
//!
//! A [`Container`] maps names to [`Source`]s: raw text plus the metadata
//! needed to decide whether a compiled [`Artifact`] is still current. This
//! crate provides the directory, ZIP archive, and in-memory containers, and
//! a [`Chain`] that consults several containers in order. Compilation itself
//! is pluggable through the [`Compiler`] trait.

#![warn(missing_docs)]

pub mod archive;
pub mod artifact;
pub mod chain;
pub mod container;
pub mod directory;
pub mod error;
pub mod memory;
pub mod source;

pub use archive::Archive;
pub use artifact::{Artifact, CodecError, CompileError, Compiler, PlainCompiler};
pub use chain::Chain;
pub use container::{CacheStatus, Container, Gate, Pass, Sources};
pub use directory::{Directory, NameStyle};
pub use error::{ErrorKind, SourceError};
pub use memory::MemoryContainer;
pub use source::{Origin, RawRead, Source};
