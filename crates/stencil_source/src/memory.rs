//! In-memory containers for tests and ephemeral scripts.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use stencil_common::Timestamp;

use crate::artifact::Artifact;
use crate::container::{Container, Gate};
use crate::error::SourceError;
use crate::source::{Origin, Source};

#[derive(Clone)]
enum Entry {
    Raw { text: Arc<[u8]>, modified: Timestamp },
    Compiled { artifact: Arc<Artifact>, modified: Timestamp },
}

/// A container holding registered `(name, text)` pairs.
///
/// Registration replaces any previous entry of the same name and stamps it
/// with the current time unless a timestamp is given.
pub struct MemoryContainer {
    label: String,
    entries: RwLock<BTreeMap<String, Entry>>,
    gate: Gate,
}

impl MemoryContainer {
    /// Creates an empty container.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            gate: Gate::new(label.clone()),
            label,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers raw text under `name`, stamped with the current time.
    pub fn insert(&self, name: impl Into<String>, text: impl AsRef<[u8]>) {
        self.insert_at(name, text, Timestamp::now());
    }

    /// Registers raw text under `name` with an explicit timestamp.
    pub fn insert_at(&self, name: impl Into<String>, text: impl AsRef<[u8]>, modified: Timestamp) {
        let entry = Entry::Raw {
            text: Arc::from(text.as_ref()),
            modified,
        };
        self.entries.write().insert(name.into(), entry);
    }

    /// Registers an already compiled artifact under `name`.
    pub fn insert_artifact(&self, name: impl Into<String>, artifact: Artifact) {
        let entry = Entry::Compiled {
            artifact: Arc::new(artifact),
            modified: Timestamp::now(),
        };
        self.entries.write().insert(name.into(), entry);
    }

    /// Removes `name`, returning whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Container for MemoryContainer {
    fn label(&self) -> &str {
        &self.label
    }

    fn lookup(&self, name: &str) -> Result<Option<Source>, SourceError> {
        let _pass = self.gate.enter()?;
        let Some(entry) = self.entries.read().get(name).cloned() else {
            return Ok(None);
        };
        let origin = Origin::Memory(self.label.clone());
        Ok(Some(match entry {
            Entry::Raw { text, modified } => Source::from_bytes(name, modified, origin, text),
            Entry::Compiled { artifact, modified } => {
                Source::compiled(name, modified, origin, artifact)
            }
        }))
    }

    fn names(&self) -> Result<Vec<String>, SourceError> {
        let _pass = self.gate.enter()?;
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn close(&self) -> Result<(), SourceError> {
        if self.gate.close() {
            self.entries.write().clear();
        }
        Ok(())
    }
}
