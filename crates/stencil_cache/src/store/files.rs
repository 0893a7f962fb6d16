//! On-disk cache store: one file per entry.
//!
//! Each entry lives at `<root>/<escaped name>.stc`. A file is a 4-byte
//! little-endian header length, a bincode [`EntryHeader`], then the
//! serialized artifact. The header carries magic bytes, a format version, the
//! entry's name and timestamps, and a checksum of the payload.
//!
//! Writes are staged in a temporary file inside the root and published by an
//! atomic rename, so readers see either the old entry or the new one, never a
//! partial write. Staged files end in `.tmp` and are never read as entries.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stencil_common::{key_hash, ContentHash, Timestamp};
use stencil_source::Artifact;
use tracing::{debug, warn};

use super::{enforce_budget, sweep_entries, CacheStore, SweepReport};
use crate::entry::{CacheEntry, EntryMeta};
use crate::error::CacheError;
use crate::policy::{EvictionPolicy, Probe};

/// Magic bytes identifying a cache entry file.
const ENTRY_MAGIC: [u8; 4] = *b"STCL";

/// Current entry format version. Increment on breaking changes to the
/// header or payload format.
const ENTRY_FORMAT_VERSION: u32 = 1;

/// Extension of published entries.
const ENTRY_EXT: &str = "stc";

/// Extension of staged, unpublished entries.
const STAGING_EXT: &str = "tmp";

/// Escaped names longer than this are replaced by a hash of the name.
const MAX_STEM_LEN: usize = 200;

/// Number of per-key locks serialising writers of the same file.
const KEY_LOCKS: usize = 64;

/// Header prepended to every cache entry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryHeader {
    magic: [u8; 4],
    format_version: u32,
    name: String,
    source_timestamp: Timestamp,
    cached_at: Timestamp,
    size_bytes: u64,
    checksum: ContentHash,
}

impl EntryHeader {
    fn meta(&self) -> EntryMeta {
        EntryMeta {
            name: self.name.clone(),
            cached_at: self.cached_at,
            source_timestamp: self.source_timestamp,
            size_bytes: self.size_bytes,
        }
    }
}

/// A cache store that keeps one file per entry under a root directory.
///
/// Entries survive process restarts. Several processes may share a root:
/// publication is atomic, and entries that fail validation are reported as
/// [`CacheError::Corrupt`] rather than served.
pub struct FileStore {
    root: PathBuf,
    policy: EvictionPolicy,
    key_locks: Box<[Mutex<()>]>,
    maintenance: Mutex<()>,
}

impl FileStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>, policy: EvictionPolicy) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, e))?;
        debug!(root = %root.display(), "opened file cache store");
        Ok(Self {
            root,
            policy,
            key_locks: (0..KEY_LOCKS).map(|_| Mutex::new(())).collect(),
            maintenance: Mutex::new(()),
        })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The file an entry for `name` is stored in.
    pub fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{ENTRY_EXT}", file_stem(name)))
    }

    fn key_lock(&self, name: &str) -> &Mutex<()> {
        &self.key_locks[key_hash(name) as usize % self.key_locks.len()]
    }

    fn read_entry(&self, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        let (header, payload) =
            split_entry(&raw).map_err(|reason| CacheError::corrupt(display_name(path), reason))?;

        let actual = ContentHash::from_bytes(payload);
        if actual != header.checksum {
            return Err(CacheError::corrupt(
                &header.name,
                format!("checksum mismatch: expected {}, got {actual}", header.checksum),
            ));
        }
        let artifact = Artifact::deserialize(payload)
            .map_err(|e| CacheError::corrupt(&header.name, e.reason))?;

        Ok(Some(CacheEntry {
            name: header.name,
            artifact: Arc::new(artifact),
            cached_at: header.cached_at,
            source_timestamp: header.source_timestamp,
            size_bytes: header.size_bytes,
        }))
    }

    /// Reads only the header of an entry file.
    fn read_header(&self, path: &Path) -> Result<Option<EntryHeader>, CacheError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        let file_len = file.metadata().map_err(|e| CacheError::io(path, e))?.len();
        let mut len = [0u8; 4];
        if file_len < 4 {
            return Err(CacheError::corrupt(display_name(path), "truncated header length"));
        }
        file.read_exact(&mut len).map_err(|e| CacheError::io(path, e))?;
        let header_len = u32::from_le_bytes(len);
        if file_len - 4 < u64::from(header_len) {
            return Err(CacheError::corrupt(display_name(path), "truncated header"));
        }
        let mut header = vec![0u8; header_len as usize];
        file.read_exact(&mut header).map_err(|e| CacheError::io(path, e))?;
        decode_header(&header)
            .map(Some)
            .map_err(|reason| CacheError::corrupt(display_name(path), reason))
    }

    fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let payload = entry.artifact.serialize().map_err(|e| CacheError::Serialization {
            reason: e.reason,
        })?;
        let header = EntryHeader {
            magic: ENTRY_MAGIC,
            format_version: ENTRY_FORMAT_VERSION,
            name: entry.name.clone(),
            source_timestamp: entry.source_timestamp,
            cached_at: entry.cached_at,
            size_bytes: entry.size_bytes,
            checksum: ContentHash::from_bytes(&payload),
        };
        let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;

        // Write: 4-byte header length (little-endian) + header + payload
        let header_len = header_bytes.len() as u32;
        let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
        output.extend_from_slice(&header_len.to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(&payload);

        let mut staged = tempfile::Builder::new()
            .prefix(".stage-")
            .suffix(&format!(".{STAGING_EXT}"))
            .tempfile_in(&self.root)
            .map_err(|e| CacheError::io(&self.root, e))?;
        io::Write::write_all(&mut staged, &output).map_err(|e| CacheError::io(staged.path(), e))?;
        let path = self.entry_path(&entry.name);
        staged
            .persist(&path)
            .map_err(|e| CacheError::io(&path, e.error))?;
        Ok(())
    }

    /// Lists published entry files and staged leftovers.
    fn scan(&self) -> Result<(Vec<PathBuf>, Vec<PathBuf>), CacheError> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(CacheError::io(&self.root, e)),
        };
        let mut published = Vec::new();
        let mut staged = Vec::new();
        for dirent in dir {
            let path = dirent.map_err(|e| CacheError::io(&self.root, e))?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(ENTRY_EXT) => published.push(path),
                Some(STAGING_EXT) => staged.push(path),
                _ => {}
            }
        }
        published.sort();
        Ok((published, staged))
    }

    /// Removes entry files whose header cannot be read.
    fn purge_corrupt(&self) -> Result<usize, CacheError> {
        let (published, _) = self.scan()?;
        let mut purged = 0;
        for path in published {
            if let Err(CacheError::Corrupt { reason, .. }) = self.read_header(&path) {
                warn!(path = %path.display(), %reason, "removing corrupt cache file");
                if remove_file(&path)? {
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}

impl CacheStore for FileStore {
    fn kind(&self) -> &'static str {
        "files"
    }

    fn get(&self, name: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entry = self.read_entry(&self.entry_path(name))?;
        match entry {
            Some(entry) if entry.name != name => Err(CacheError::corrupt(
                name,
                format!("file holds entry '{}'", entry.name),
            )),
            other => Ok(other),
        }
    }

    fn put(
        &self,
        name: &str,
        artifact: Arc<Artifact>,
        source_timestamp: Timestamp,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry::new(name, artifact, source_timestamp);
        {
            let _key = self.key_lock(name).lock();
            self.write_entry(&entry)?;
        }
        if self.policy.is_bounded() {
            let _guard = self.maintenance.lock();
            enforce_budget(self)?;
        }
        Ok(entry)
    }

    fn remove(&self, name: &str) -> Result<bool, CacheError> {
        let _key = self.key_lock(name).lock();
        remove_file(&self.entry_path(name))
    }

    fn remove_if(&self, name: &str, cached_at: Timestamp) -> Result<bool, CacheError> {
        let _key = self.key_lock(name).lock();
        let path = self.entry_path(name);
        match self.read_header(&path) {
            Ok(Some(header)) if header.cached_at == cached_at => remove_file(&path),
            Ok(_) => Ok(false),
            Err(CacheError::Corrupt { .. }) => remove_file(&path),
            Err(e) => Err(e),
        }
    }

    fn entries(&self) -> Result<Vec<EntryMeta>, CacheError> {
        let (published, _) = self.scan()?;
        let mut metas = Vec::with_capacity(published.len());
        for path in published {
            match self.read_header(&path) {
                Ok(Some(header)) => metas.push(header.meta()),
                Ok(None) => {}
                Err(CacheError::Corrupt { reason, .. }) => {
                    debug!(path = %path.display(), %reason, "skipping unreadable cache file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(metas)
    }

    fn clear(&self) -> Result<usize, CacheError> {
        let _guard = self.maintenance.lock();
        let (published, staged) = self.scan()?;
        let mut removed = 0;
        for path in published {
            if remove_file(&path)? {
                removed += 1;
            }
        }
        for path in staged {
            remove_file(&path)?;
        }
        Ok(removed)
    }

    fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    fn sweep(&self, probe: &dyn Fn(&str) -> Probe) -> Result<SweepReport, CacheError> {
        let _guard = self.maintenance.lock();
        let purged = self.purge_corrupt()?;
        let mut report = sweep_entries(self, probe)?;
        report.expired += purged;
        Ok(report)
    }
}

/// Splits an entry file into its validated header and payload.
fn split_entry(raw: &[u8]) -> Result<(EntryHeader, &[u8]), String> {
    if raw.len() < 4 {
        return Err("truncated header length".to_string());
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&raw[..4]);
    let header_len = u32::from_le_bytes(len) as usize;
    if raw.len() - 4 < header_len {
        return Err("truncated header".to_string());
    }
    let header = decode_header(&raw[4..4 + header_len])?;
    Ok((header, &raw[4 + header_len..]))
}

fn decode_header(bytes: &[u8]) -> Result<EntryHeader, String> {
    let (header, _): (EntryHeader, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| format!("invalid header: {e}"))?;
    if header.magic != ENTRY_MAGIC {
        return Err("missing magic bytes".to_string());
    }
    if header.format_version != ENTRY_FORMAT_VERSION {
        return Err(format!(
            "format version {} (expected {ENTRY_FORMAT_VERSION})",
            header.format_version
        ));
    }
    Ok(header)
}

/// Maps a name to a file stem that is safe on common file systems.
///
/// ASCII letters, digits, `-`, `_` and non-leading `.` are kept; every other
/// byte becomes `%XX`. Overlong results are replaced by `#` and the name's
/// hash.
fn file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    if stem.is_empty() {
        stem.push('%');
    }
    if stem.len() > MAX_STEM_LEN {
        return format!("#{}", ContentHash::from_bytes(name.as_bytes()));
    }
    stem
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Removes a file, treating an already missing file as not removed.
fn remove_file(path: &Path) -> Result<bool, CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io(path, e)),
    }
}
