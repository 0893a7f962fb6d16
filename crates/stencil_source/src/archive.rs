//! Containers backed by a read-only ZIP archive.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use stencil_common::Timestamp;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::container::{Container, Gate};
use crate::error::SourceError;
use crate::source::{Origin, RawRead, Source};

struct Shared {
    path: PathBuf,
    gate: Gate,
    zip: Mutex<Option<ZipArchive<File>>>,
}

impl Shared {
    fn archive_error(&self, e: ZipError) -> SourceError {
        SourceError::Archive {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }

    fn closed(&self) -> SourceError {
        SourceError::Closed(format!("zip:{}", self.path.display()))
    }
}

/// A container over the entries of a ZIP archive.
///
/// Every source shares the archive file's modification time, read once when
/// the archive is opened; per-entry timestamps in ZIP files have a two-second
/// resolution and no time zone, which is too coarse for staleness checks.
pub struct Archive {
    shared: Arc<Shared>,
    suffixes: Vec<String>,
    modified: Timestamp,
    label: String,
}

impl Archive {
    /// Opens the archive at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| SourceError::io(&path, e))?;
        let modified = file
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| SourceError::io(&path, e))?;
        let zip = ZipArchive::new(file).map_err(|e| SourceError::Archive {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!(archive = %path.display(), entries = zip.len(), "opened archive container");
        Ok(Self {
            label: format!("zip:{}", path.display()),
            shared: Arc::new(Shared {
                gate: Gate::new(format!("zip:{}", path.display())),
                path,
                zip: Mutex::new(Some(zip)),
            }),
            suffixes: Vec::new(),
            modified: Timestamp::from_system_time(modified),
        })
    }

    /// Restricts eligible entries to the given suffixes (without the dot).
    pub fn with_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suffixes = suffixes
            .into_iter()
            .map(|s| s.into().trim_start_matches('.').to_string())
            .collect();
        self
    }

    /// Path of the archive file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Modification time shared by every entry.
    pub fn modified(&self) -> Timestamp {
        self.modified
    }

    fn suffix_allowed(&self, entry: &str) -> bool {
        if self.suffixes.is_empty() {
            return true;
        }
        Path::new(entry)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.suffixes.iter().any(|s| s == ext))
    }

    fn candidates(&self, name: &str) -> Vec<String> {
        if self.suffix_allowed(name) {
            return vec![name.to_string()];
        }
        self.suffixes.iter().map(|s| format!("{name}.{s}")).collect()
    }

    /// The single name under which `entry` is listed: without its suffix
    /// when that bare name looks the entry up, else the entry name itself.
    fn name_for(&self, entry: &str, entries: &BTreeSet<&str>) -> String {
        let ext_len = Path::new(entry)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::len);
        if let Some(ext_len) = ext_len.filter(|_| !self.suffixes.is_empty()) {
            let bare = &entry[..entry.len() - ext_len - 1];
            let first = self
                .candidates(bare)
                .into_iter()
                .find(|c| entries.contains(c.as_str()));
            if first.as_deref() == Some(entry) {
                return bare.to_string();
            }
        }
        entry.to_string()
    }
}

impl Container for Archive {
    fn label(&self) -> &str {
        &self.label
    }

    fn lookup(&self, name: &str) -> Result<Option<Source>, SourceError> {
        let _pass = self.shared.gate.enter()?;
        let mut guard = self.shared.zip.lock();
        let zip = guard.as_mut().ok_or_else(|| self.shared.closed())?;
        for entry in self.candidates(name) {
            let is_file = match zip.by_name(&entry) {
                Ok(file) => !file.is_dir(),
                Err(ZipError::FileNotFound) => continue,
                Err(e) => return Err(self.shared.archive_error(e)),
            };
            if !is_file {
                continue;
            }
            let reader = EntryReader {
                shared: Arc::clone(&self.shared),
                entry: entry.clone(),
            };
            return Ok(Some(Source::from_reader(
                name,
                self.modified,
                Origin::ArchiveEntry {
                    archive: self.shared.path.clone(),
                    entry,
                },
                Box::new(reader),
            )));
        }
        Ok(None)
    }

    fn names(&self) -> Result<Vec<String>, SourceError> {
        let _pass = self.shared.gate.enter()?;
        let guard = self.shared.zip.lock();
        let zip = guard.as_ref().ok_or_else(|| self.shared.closed())?;
        let entries: BTreeSet<&str> = zip
            .file_names()
            .filter(|n| !n.ends_with('/') && self.suffix_allowed(n))
            .collect();
        Ok(entries
            .iter()
            .map(|entry| self.name_for(entry, &entries))
            .collect())
    }

    fn close(&self) -> Result<(), SourceError> {
        if self.shared.gate.close() {
            self.shared.zip.lock().take();
            debug!(container = %self.label, "closed archive container");
        }
        Ok(())
    }
}

struct EntryReader {
    shared: Arc<Shared>,
    entry: String,
}

impl RawRead for EntryReader {
    fn read_raw(&self) -> Result<Vec<u8>, SourceError> {
        let _pass = self.shared.gate.enter()?;
        let mut guard = self.shared.zip.lock();
        let zip = guard.as_mut().ok_or_else(|| self.shared.closed())?;
        let mut file = zip
            .by_name(&self.entry)
            .map_err(|e| self.shared.archive_error(e))?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| SourceError::io(&self.shared.path, e))?;
        Ok(buf)
    }
}
