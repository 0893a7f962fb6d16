//! Containers backed by a directory tree on disk.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use stencil_common::Timestamp;
use tracing::debug;
use walkdir::WalkDir;

use crate::container::{Container, Gate};
use crate::error::SourceError;
use crate::source::{Origin, RawRead, Source};

/// How names map onto relative paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameStyle {
    /// Names are `/`-separated relative paths, e.g. `blog/post`.
    #[default]
    Path,
    /// Names are dotted identifiers, e.g. `blog.post`; suffixes are implied.
    Dotted,
}

/// A file handle shared between a source and the container that issued it.
type Handle = Arc<Mutex<Option<File>>>;

/// A container of files below a root directory.
///
/// A name that already carries an allowed suffix is used as is; otherwise
/// each allowed suffix is tried in order. With no suffixes configured every
/// file is eligible. In strict mode (the default) names that would resolve
/// outside the root, including through symlinks, are rejected.
///
/// [`names`](Container::names) lists each file once, under the shortest name
/// that looks it up: without its suffix when suffixes are configured, unless
/// that bare name resolves to another file first.
pub struct Directory {
    root: PathBuf,
    suffixes: Vec<String>,
    style: NameStyle,
    strict: bool,
    label: String,
    gate: Arc<Gate>,
    handles: Mutex<Vec<Weak<Mutex<Option<File>>>>>,
}

impl Directory {
    /// Creates a strict, path-style container rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let label = format!("dir:{}", root.display());
        Self {
            gate: Arc::new(Gate::new(label.clone())),
            root,
            suffixes: Vec::new(),
            style: NameStyle::Path,
            strict: true,
            label,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Restricts eligible files to the given suffixes (without the dot).
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

    /// Selects how names are interpreted.
    pub fn with_name_style(mut self, style: NameStyle) -> Self {
        self.style = style;
        self
    }

    /// Enables or disables rejection of names escaping the root.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn suffix_allowed(&self, path: &Path) -> bool {
        if self.suffixes.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.suffixes.iter().any(|s| s == ext))
    }

    /// Turns a name into a relative path, validating it in strict mode.
    fn relative_path(&self, name: &str) -> Result<PathBuf, SourceError> {
        let invalid = |reason: &str| SourceError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        let relative = match self.style {
            NameStyle::Path => PathBuf::from(name),
            NameStyle::Dotted => {
                if name.split('.').any(str::is_empty) {
                    return Err(invalid("empty dotted segment"));
                }
                name.split('.').collect()
            }
        };
        if self.strict {
            for component in relative.components() {
                match component {
                    Component::Normal(_) | Component::CurDir => {}
                    Component::ParentDir => return Err(invalid("leaves the root directory")),
                    Component::RootDir | Component::Prefix(_) => {
                        return Err(invalid("absolute names are not allowed"))
                    }
                }
            }
        }
        Ok(relative)
    }

    fn candidates(&self, relative: &Path) -> Vec<PathBuf> {
        let direct = self.style == NameStyle::Path && self.suffix_allowed(relative);
        if direct {
            return vec![self.root.join(relative)];
        }
        let mut out = Vec::with_capacity(self.suffixes.len());
        for suffix in &self.suffixes {
            let mut file_name = relative.as_os_str().to_owned();
            file_name.push(".");
            file_name.push(suffix);
            out.push(self.root.join(file_name));
        }
        out
    }

    fn check_inside_root(&self, name: &str, path: &Path) -> Result<(), SourceError> {
        let root = fs::canonicalize(&self.root).map_err(|e| SourceError::io(&self.root, e))?;
        let real = fs::canonicalize(path).map_err(|e| SourceError::io(path, e))?;
        if real.starts_with(&root) {
            Ok(())
        } else {
            Err(SourceError::InvalidName {
                name: name.to_string(),
                reason: format!("resolves to {} outside the root directory", real.display()),
            })
        }
    }

    fn open(&self, name: &str, path: PathBuf) -> Result<Option<Source>, SourceError> {
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SourceError::io(path, e)),
        };
        let meta = file.metadata().map_err(|e| SourceError::io(&path, e))?;
        if !meta.is_file() {
            return Ok(None);
        }
        if self.strict {
            self.check_inside_root(name, &path)?;
        }
        let modified = meta.modified().map_err(|e| SourceError::io(&path, e))?;
        let reader = FileReader {
            file: self.track(file),
            path: path.clone(),
            gate: Arc::clone(&self.gate),
        };
        Ok(Some(Source::from_reader(
            name,
            Timestamp::from_system_time(modified),
            Origin::File(path),
            Box::new(reader),
        )))
    }

    /// Registers an open handle so that closing the container releases it.
    fn track(&self, file: File) -> Handle {
        let handle = Arc::new(Mutex::new(Some(file)));
        let mut handles = self.handles.lock();
        handles.retain(|h| h.strong_count() > 0);
        handles.push(Arc::downgrade(&handle));
        handle
    }

    /// Releases every handle still held by an issued source.
    fn release_handles(&self) -> usize {
        let mut released = 0;
        for handle in self.handles.lock().drain(..) {
            if let Some(handle) = handle.upgrade() {
                if handle.lock().take().is_some() {
                    released += 1;
                }
            }
        }
        released
    }

    #[cfg(test)]
    fn open_handles(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|h| h.lock().is_some())
            .count()
    }

    /// The file `name` looks up, if any.
    fn resolves_to(&self, name: &str) -> Option<PathBuf> {
        let relative = self.relative_path(name).ok()?;
        self.candidates(&relative).into_iter().find(|p| p.is_file())
    }

    /// The single name under which `relative` is listed, or `None` if no
    /// name looks it up.
    fn name_for(&self, relative: &Path) -> Option<String> {
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        let file = self.root.join(relative);
        let ext_len = relative.extension().and_then(|e| e.to_str()).map(str::len);
        match self.style {
            NameStyle::Path => {
                let full = parts.join("/");
                if let Some(ext_len) = ext_len.filter(|_| !self.suffixes.is_empty()) {
                    let bare = &full[..full.len() - ext_len - 1];
                    if self.resolves_to(bare).as_ref() == Some(&file) {
                        return Some(bare.to_string());
                    }
                }
                Some(full)
            }
            NameStyle::Dotted => {
                let joined = parts.join(".");
                let name = &joined[..joined.len() - ext_len? - 1];
                (self.resolves_to(name).as_ref() == Some(&file)).then(|| name.to_string())
            }
        }
    }
}

impl Container for Directory {
    fn label(&self) -> &str {
        &self.label
    }

    fn lookup(&self, name: &str) -> Result<Option<Source>, SourceError> {
        let _pass = self.gate.enter()?;
        let relative = self.relative_path(name)?;
        for path in self.candidates(&relative) {
            if let Some(source) = self.open(name, path)? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    fn names(&self) -> Result<Vec<String>, SourceError> {
        let _pass = self.gate.enter()?;
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| SourceError::io(&self.root, io::Error::from(e)))?;
            if !entry.file_type().is_file() || !self.suffix_allowed(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if let Some(name) = self.name_for(relative) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn close(&self) -> Result<(), SourceError> {
        if self.gate.close() {
            let released = self.release_handles();
            debug!(container = %self.label, released, "closed directory container");
        }
        Ok(())
    }
}

/// Reads a file through the handle opened at lookup time.
struct FileReader {
    file: Handle,
    path: PathBuf,
    gate: Arc<Gate>,
}

impl RawRead for FileReader {
    fn read_raw(&self) -> Result<Vec<u8>, SourceError> {
        let _pass = self.gate.enter()?;
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| SourceError::Closed(self.gate.label().to_string()))?;
        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut buf))
            .map_err(|e| SourceError::io(&self.path, e))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Directory) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("blog")).unwrap();
        fs::write(dir.path().join("index.tpl"), "index").unwrap();
        fs::write(dir.path().join("blog/post.tpl"), "post").unwrap();
        fs::write(dir.path().join("notes.txt"), "notes").unwrap();
        let container = Directory::new(dir.path()).with_suffixes(["tpl"]);
        (dir, container)
    }

    #[test]
    fn lookup_appends_suffix() {
        let (_dir, container) = setup();
        let src = container.lookup("index").unwrap().unwrap();
        assert_eq!(src.read_raw().unwrap(), b"index");
        assert_eq!(src.name(), "index");
    }

    #[test]
    fn lookup_with_explicit_suffix() {
        let (_dir, container) = setup();
        let src = container.lookup("blog/post.tpl").unwrap().unwrap();
        assert_eq!(src.read_raw().unwrap(), b"post");
    }

    #[test]
    fn disallowed_suffix_is_not_found() {
        let (_dir, container) = setup();
        assert!(container.lookup("notes.txt").unwrap().is_none());
        assert!(!container.contains("notes").unwrap());
    }

    #[test]
    fn missing_name_is_not_found() {
        let (_dir, container) = setup();
        assert!(container.lookup("nope").unwrap().is_none());
    }

    #[test]
    fn directories_are_not_sources() {
        let (_dir, container) = setup();
        let container = container.with_suffixes(Vec::<String>::new());
        assert!(container.lookup("blog").unwrap().is_none());
    }

    #[test]
    fn traversal_is_rejected() {
        let (_dir, container) = setup();
        let err = container.lookup("../etc/passwd").unwrap_err();
        assert!(matches!(err, SourceError::InvalidName { .. }));
        let err = container.lookup("/etc/passwd").unwrap_err();
        assert!(matches!(err, SourceError::InvalidName { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.tpl"), "secret").unwrap();
        let (dir, container) = setup();
        std::os::unix::fs::symlink(outside.path().join("secret.tpl"), dir.path().join("link.tpl"))
            .unwrap();
        let err = container.lookup("link").unwrap_err();
        assert!(matches!(err, SourceError::InvalidName { .. }));
    }

    #[test]
    fn non_strict_allows_parent_components() {
        let (dir, _) = setup();
        let nested = Directory::new(dir.path().join("blog"))
            .with_suffixes(["tpl"])
            .strict(false);
        let src = nested.lookup("../index").unwrap().unwrap();
        assert_eq!(src.read_raw().unwrap(), b"index");
    }

    #[test]
    fn dotted_names() {
        let (_dir, container) = setup();
        let container = container.with_name_style(NameStyle::Dotted);
        let src = container.lookup("blog.post").unwrap().unwrap();
        assert_eq!(src.read_raw().unwrap(), b"post");
        assert_eq!(container.names().unwrap(), vec!["blog.post", "index"]);
    }

    #[test]
    fn names_lists_allowed_files() {
        let (_dir, container) = setup();
        assert_eq!(container.names().unwrap(), vec!["blog/post", "index"]);
    }

    #[test]
    fn repeated_lookup_is_idempotent() {
        let (_dir, container) = setup();
        let a = container.lookup("index").unwrap().unwrap();
        let b = container.lookup("index").unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sources_enumerates_everything() {
        let (_dir, container) = setup();
        let names: Vec<String> = container
            .sources()
            .unwrap()
            .map(|s| s.unwrap().name().to_string())
            .collect();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn search_filters_by_pattern() {
        let (_dir, container) = setup();
        let pattern = regex::Regex::new("^blog/").unwrap();
        let found: Vec<String> = container
            .search(&pattern)
            .unwrap()
            .map(|s| s.unwrap().name().to_string())
            .collect();
        assert_eq!(found, vec!["blog/post"]);
    }

    #[test]
    fn close_invalidates_issued_sources() {
        let (_dir, container) = setup();
        let src = container.lookup("index").unwrap().unwrap();
        container.close().unwrap();
        assert!(matches!(src.read_raw(), Err(SourceError::Closed(_))));
        assert!(matches!(container.lookup("index"), Err(SourceError::Closed(_))));
        container.close().unwrap();
    }

    #[test]
    fn reread_sees_new_content() {
        let (dir, container) = setup();
        let src = container.lookup("index").unwrap().unwrap();
        fs::write(dir.path().join("index.tpl"), "changed").unwrap();
        let again = container.lookup("index").unwrap().unwrap();
        assert_eq!(again.read_raw().unwrap(), b"changed");
        drop(src);
    }

    #[test]
    fn listed_names_look_up_the_listed_file() {
        let (dir, container) = setup();
        fs::write(dir.path().join("index"), "bare").unwrap();
        fs::write(dir.path().join("page.tpl.tpl"), "doubled").unwrap();
        let names = container.names().unwrap();
        assert_eq!(names, vec!["blog/post", "index", "page.tpl.tpl"]);
        for name in &names {
            assert!(container.lookup(name).unwrap().is_some(), "{name}");
        }
    }

    #[test]
    fn colliding_bare_names_keep_their_suffix() {
        let (dir, container) = setup();
        fs::write(dir.path().join("index.html"), "html").unwrap();
        let container = container.with_suffixes(["tpl", "html"]);
        assert_eq!(container.names().unwrap(), vec!["blog/post", "index.html", "index"]);
        let html = container.lookup("index.html").unwrap().unwrap();
        assert_eq!(html.read_raw().unwrap(), b"html");
    }

    #[test]
    fn dotted_names_skip_files_with_dots() {
        let (dir, container) = setup();
        fs::write(dir.path().join("a.b.tpl"), "dotted").unwrap();
        let container = container.with_name_style(NameStyle::Dotted);
        assert_eq!(container.names().unwrap(), vec!["blog.post", "index"]);
        assert!(container.lookup("a.b").unwrap().is_none());
    }

    #[test]
    fn close_releases_file_handles_of_live_sources() {
        let (_dir, container) = setup();
        let index = container.lookup("index").unwrap().unwrap();
        let post = container.lookup("blog/post").unwrap().unwrap();
        assert_eq!(container.open_handles(), 2);
        container.close().unwrap();
        assert_eq!(container.open_handles(), 0);
        assert!(matches!(index.read_raw(), Err(SourceError::Closed(_))));
        drop(post);
    }

    #[test]
    fn dropped_sources_are_forgotten() {
        let (_dir, container) = setup();
        for _ in 0..3 {
            drop(container.lookup("index").unwrap().unwrap());
        }
        let _live = container.lookup("index").unwrap().unwrap();
        assert_eq!(container.handles.lock().len(), 1);
    }
}
