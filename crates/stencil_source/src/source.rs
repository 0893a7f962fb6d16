//! Handles to individual units of raw template content.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use stencil_common::Timestamp;

use crate::artifact::{Artifact, Compiler};
use crate::error::SourceError;

/// Where a [`Source`] came from. Only meaningful to the container that made it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A file on disk.
    File(PathBuf),
    /// An entry inside an archive.
    ArchiveEntry {
        /// Path of the archive file.
        archive: PathBuf,
        /// Entry name inside the archive.
        entry: String,
    },
    /// An in-memory container, identified by its label.
    Memory(String),
    /// An artifact served from a cache.
    Cache(String),
}

/// Deferred access to raw bytes held by a container.
///
/// Implementations typically keep a live handle (an open file) and must fail
/// with [`SourceError::Closed`] once their container has been closed.
pub trait RawRead: Send + Sync {
    /// Reads the complete raw content.
    fn read_raw(&self) -> Result<Vec<u8>, SourceError>;
}

enum Body {
    Reader(Box<dyn RawRead>),
    Bytes(Arc<[u8]>),
    Compiled(Arc<Artifact>),
}

/// A named, timestamped handle to one unit of raw content.
///
/// Two sources compare equal when their name, origin and modification time
/// agree, which is what a repeated lookup of an unchanged name produces.
pub struct Source {
    name: String,
    last_modified: Timestamp,
    origin: Origin,
    body: Body,
}

impl Source {
    /// Creates a source whose content is read on demand.
    pub fn from_reader(
        name: impl Into<String>,
        last_modified: Timestamp,
        origin: Origin,
        reader: Box<dyn RawRead>,
    ) -> Self {
        Self {
            name: name.into(),
            last_modified,
            origin,
            body: Body::Reader(reader),
        }
    }

    /// Creates a source over bytes already in memory.
    pub fn from_bytes(
        name: impl Into<String>,
        last_modified: Timestamp,
        origin: Origin,
        bytes: Arc<[u8]>,
    ) -> Self {
        Self {
            name: name.into(),
            last_modified,
            origin,
            body: Body::Bytes(bytes),
        }
    }

    /// Creates a source that already holds its compiled artifact.
    pub fn compiled(
        name: impl Into<String>,
        last_modified: Timestamp,
        origin: Origin,
        artifact: Arc<Artifact>,
    ) -> Self {
        Self {
            name: name.into(),
            last_modified,
            origin,
            body: Body::Compiled(artifact),
        }
    }

    /// Name of this source, unique within its container.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Modification time used for staleness checks.
    pub fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    /// Container-specific locator.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Returns the artifact if this source is already compiled.
    pub fn artifact(&self) -> Option<&Arc<Artifact>> {
        match &self.body {
            Body::Compiled(artifact) => Some(artifact),
            _ => None,
        }
    }

    /// Reads the raw text.
    ///
    /// Precompiled sources return the artifact's code, which is the closest
    /// thing to raw text they still have.
    pub fn read_raw(&self) -> Result<Vec<u8>, SourceError> {
        match &self.body {
            Body::Reader(reader) => reader.read_raw(),
            Body::Bytes(bytes) => Ok(bytes.to_vec()),
            Body::Compiled(artifact) => Ok(artifact.code.clone()),
        }
    }

    /// Returns the compiled artifact, compiling the raw text if needed.
    pub fn load(&self, compiler: &dyn Compiler) -> Result<Arc<Artifact>, SourceError> {
        if let Body::Compiled(artifact) = &self.body {
            return Ok(Arc::clone(artifact));
        }
        let raw = self.read_raw()?;
        Ok(Arc::new(compiler.compile(&self.name, &raw)?))
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.origin == other.origin
            && self.last_modified == other.last_modified
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match self.body {
            Body::Reader(_) => "reader",
            Body::Bytes(_) => "bytes",
            Body::Compiled(_) => "compiled",
        };
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("last_modified", &self.last_modified)
            .field("origin", &self.origin)
            .field("body", &body)
            .finish()
    }
}
