//! Behavioural tests for the cache decorator over real containers and stores.
//!
//! These tests exercise staleness detection against files on disk,
//! single-flight compilation under concurrent callers, size-bounded
//! eviction, and self-healing of corrupt on-disk entries.

use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime};

use stencil_cache::{
    CacheStore, CachedContainer, EvictionPolicy, FileStore, MemoryStore, ResolveKind,
    ScriptHost, PlainExecutor, Env, ResolveError,
};
use stencil_source::{
    Artifact, CompileError, Compiler, Container, Directory, ErrorKind, MemoryContainer,
    PlainCompiler, SourceError,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helper: a compiler that counts its invocations
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CountingCompiler {
    calls: AtomicUsize,
    delay: Duration,
    panic_first: bool,
}

impl CountingCompiler {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compiler for CountingCompiler {
    fn id(&self) -> &str {
        "counting/1"
    }

    fn compile(&self, name: &str, raw: &[u8]) -> Result<Artifact, CompileError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if self.panic_first && call == 0 {
            panic!("compiler crashed");
        }
        PlainCompiler.compile(name, raw)
    }
}

// ---------------------------------------------------------------------------
// Helper: template directories with controlled modification times
// ---------------------------------------------------------------------------

fn write_template(dir: &Path, file: &str, text: &str, mtime_secs: u64) {
    let path = dir.join(file);
    fs::write(&path, text).unwrap();
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs);
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

fn templates() -> (TempDir, Directory) {
    let dir = tempfile::tempdir().unwrap();
    let container = Directory::new(dir.path()).with_suffixes(["tpl"]);
    (dir, container)
}

fn memory_store(policy: EvictionPolicy) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(policy))
}

// ===========================================================================
// Hits and staleness
// ===========================================================================

#[test]
fn immediate_second_resolve_does_not_compile() {
    let (dir, container) = templates();
    write_template(dir.path(), "index.tpl", "<h1>Index</h1>", 1_000);
    let compiler = Arc::new(CountingCompiler::default());
    let cached = CachedContainer::new(container, memory_store(EvictionPolicy::unbounded()), compiler.clone());

    let first = cached.resolve("index").unwrap().unwrap();
    let second = cached.resolve("index").unwrap().unwrap();

    assert_eq!(first.code, second.code);
    assert_eq!(compiler.calls(), 1);
}

#[test]
fn edited_file_is_recompiled_exactly_once() {
    let (dir, container) = templates();
    let cache_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(cache_dir.path(), EvictionPolicy::unbounded()).unwrap());
    let compiler = Arc::new(CountingCompiler::default());
    let cached = CachedContainer::new(container, store.clone(), compiler.clone());

    write_template(dir.path(), "a.tpl", "X", 1_000);
    assert_eq!(cached.resolve("a").unwrap().unwrap().code, b"X");
    let t0 = store.get("a").unwrap().unwrap().source_timestamp;

    write_template(dir.path(), "a.tpl", "Y", 2_000);
    assert_eq!(cached.resolve("a").unwrap().unwrap().code, b"Y");
    assert_eq!(cached.resolve("a").unwrap().unwrap().code, b"Y");

    let entry = store.get("a").unwrap().unwrap();
    assert!(entry.source_timestamp > t0);
    assert_eq!(
        entry.source_timestamp,
        stencil_common::Timestamp::from_system_time(SystemTime::UNIX_EPOCH + Duration::from_secs(2_000))
    );
    assert_eq!(compiler.calls(), 2);
}

#[test]
fn deleted_file_is_not_found_and_uncached() {
    let (dir, container) = templates();
    write_template(dir.path(), "gone.tpl", "bye", 1_000);
    let store = memory_store(EvictionPolicy::unbounded());
    let cached = CachedContainer::new(container, store.clone(), Arc::new(PlainCompiler));

    cached.fetch("gone").unwrap();
    fs::remove_file(dir.path().join("gone.tpl")).unwrap();

    assert!(cached.resolve("gone").unwrap().is_none());
    assert!(store.get("gone").unwrap().is_none());
}

#[test]
fn clear_forces_recompilation() {
    let (dir, container) = templates();
    write_template(dir.path(), "a.tpl", "X", 1_000);
    write_template(dir.path(), "b.tpl", "Y", 1_000);
    let compiler = Arc::new(CountingCompiler::default());
    let cached = CachedContainer::new(container, memory_store(EvictionPolicy::unbounded()), compiler.clone());

    cached.fetch("a").unwrap();
    cached.fetch("b").unwrap();
    assert_eq!(cached.clear().unwrap(), 2);
    cached.resolve("a").unwrap();
    cached.resolve("b").unwrap();

    assert_eq!(compiler.calls(), 4);
}

#[test]
fn warming_every_listed_name_serves_bare_requests() {
    let (dir, container) = templates();
    fs::create_dir(dir.path().join("blog")).unwrap();
    write_template(dir.path(), "index.tpl", "home", 1_000);
    write_template(dir.path(), "blog/post.tpl", "post", 1_000);
    let store = memory_store(EvictionPolicy::unbounded());
    let compiler = Arc::new(CountingCompiler::default());
    let cached = CachedContainer::new(container, store.clone(), compiler.clone());

    for name in cached.names().unwrap() {
        assert!(cached.fetch(&name).unwrap());
    }
    cached.resolve("index").unwrap().unwrap();
    cached.resolve("blog/post").unwrap().unwrap();

    assert_eq!(compiler.calls(), 2);
    assert_eq!(store.len().unwrap(), 2);
    assert_eq!(cached.cached_names().unwrap(), ["blog/post", "index"]);
}

// ===========================================================================
// Single-flight compilation
// ===========================================================================

#[test]
fn fifty_concurrent_callers_compile_once() {
    let (dir, container) = templates();
    write_template(dir.path(), "hot.tpl", "popular page", 1_000);
    let compiler = Arc::new(CountingCompiler::slow(Duration::from_millis(50)));
    let cached = Arc::new(CachedContainer::new(
        container,
        memory_store(EvictionPolicy::unbounded()),
        compiler.clone(),
    ));
    let barrier = Arc::new(Barrier::new(50));

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let cached = Arc::clone(&cached);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cached.resolve("hot").unwrap().unwrap()
            })
        })
        .collect();
    let artifacts: Vec<Arc<Artifact>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(compiler.calls(), 1);
    assert!(artifacts.iter().all(|a| a.code == b"popular page"));
}

#[test]
fn compile_error_reaches_every_waiter_and_is_not_cached() {
    let mem = MemoryContainer::new("mem");
    mem.insert("broken", [b'o', b'k', 0xFF]);
    let compiler = Arc::new(CountingCompiler::slow(Duration::from_millis(300)));
    let cached = Arc::new(CachedContainer::new(
        mem,
        memory_store(EvictionPolicy::unbounded()),
        compiler.clone(),
    ));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cached = Arc::clone(&cached);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cached.resolve("broken").unwrap_err()
            })
        })
        .collect();
    let errors: Vec<SourceError> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(compiler.calls(), 1);
    for err in &errors {
        match err {
            SourceError::Compile(e) => {
                assert_eq!((e.line, e.column), (1, 3));
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }
    assert!(cached.store().is_empty().unwrap());

    cached.resolve("broken").unwrap_err();
    assert_eq!(compiler.calls(), 2);
}

#[test]
fn waiter_times_out_on_slow_compilation() {
    let mem = MemoryContainer::new("mem");
    mem.insert("slow", "eventually");
    let cached = Arc::new(
        CachedContainer::new(
            mem,
            memory_store(EvictionPolicy::unbounded()),
            Arc::new(CountingCompiler::slow(Duration::from_millis(500))),
        )
        .with_wait_timeout(Duration::from_millis(50)),
    );

    let leader = {
        let cached = Arc::clone(&cached);
        thread::spawn(move || cached.resolve("slow"))
    };
    thread::sleep(Duration::from_millis(100));
    let err = cached.resolve("slow").unwrap_err();

    assert!(matches!(err, SourceError::Timeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Retryable);
    assert!(leader.join().unwrap().unwrap().is_some());
    assert!(cached.resolve("slow").unwrap().is_some());
}

#[test]
fn crashed_leader_hands_over_to_a_waiter() {
    let mem = MemoryContainer::new("mem");
    mem.insert("fragile", "text");
    let compiler = Arc::new(CountingCompiler {
        delay: Duration::from_millis(200),
        panic_first: true,
        ..CountingCompiler::default()
    });
    let cached = Arc::new(CachedContainer::new(
        mem,
        memory_store(EvictionPolicy::unbounded()),
        compiler.clone(),
    ));

    let crashing = {
        let cached = Arc::clone(&cached);
        thread::spawn(move || cached.resolve("fragile"))
    };
    thread::sleep(Duration::from_millis(50));
    let artifact = cached.resolve("fragile").unwrap().unwrap();

    assert!(crashing.join().is_err());
    assert_eq!(artifact.code, b"text");
    assert_eq!(compiler.calls(), 2);
}

// ===========================================================================
// Eviction
// ===========================================================================

#[test]
fn two_entry_store_evicts_oldest_cached() {
    let mem = MemoryContainer::new("mem");
    for name in ["first", "second", "third"] {
        mem.insert(name, name);
    }
    let store = memory_store(EvictionPolicy::unbounded().with_max_entries(2));
    let cached = CachedContainer::new(mem, store.clone(), Arc::new(PlainCompiler));

    cached.fetch("first").unwrap();
    cached.fetch("second").unwrap();
    cached.fetch("third").unwrap();

    assert!(store.get("first").unwrap().is_none());
    assert!(store.get("second").unwrap().is_some());
    assert!(store.get("third").unwrap().is_some());
}

#[test]
fn sweep_respects_byte_budget_and_keeps_fresh_entries() {
    let mem = MemoryContainer::new("mem");
    for i in 0..10 {
        mem.insert(format!("page{i}"), "0123456789".repeat(10));
    }
    let unbounded = memory_store(EvictionPolicy::unbounded());
    let cached = CachedContainer::new(mem, unbounded.clone(), Arc::new(PlainCompiler));
    for i in 0..10 {
        cached.fetch(&format!("page{i}")).unwrap();
    }

    let report = cached.sweep().unwrap();
    assert_eq!(report.removed(), 0);
    assert_eq!(report.remaining, 10);

    let budget = unbounded.total_bytes().unwrap() / 2;
    let bounded = memory_store(EvictionPolicy::unbounded().with_max_bytes(budget));
    for meta in unbounded.entries().unwrap() {
        let entry = unbounded.get(&meta.name).unwrap().unwrap();
        bounded.put(&entry.name, entry.artifact, entry.source_timestamp).unwrap();
    }
    assert!(bounded.total_bytes().unwrap() <= budget);
}

// ===========================================================================
// Corrupt entries
// ===========================================================================

#[test]
fn corrupt_file_entry_is_recompiled() {
    let (dir, container) = templates();
    write_template(dir.path(), "a.tpl", "X", 1_000);
    let cache_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(cache_dir.path(), EvictionPolicy::unbounded()).unwrap());
    let compiler = Arc::new(CountingCompiler::default());
    let cached = CachedContainer::new(container, store.clone(), compiler.clone());

    cached.fetch("a").unwrap();
    fs::write(store.entry_path("a"), b"not a cache entry").unwrap();

    assert_eq!(cached.resolve("a").unwrap().unwrap().code, b"X");
    assert_eq!(compiler.calls(), 2);
    assert!(store.get("a").unwrap().is_some());
}

#[test]
fn file_cache_is_shared_across_instances() {
    let (dir, _) = templates();
    write_template(dir.path(), "a.tpl", "X", 1_000);
    let cache_dir = tempfile::tempdir().unwrap();
    let compiler = Arc::new(CountingCompiler::default());

    for _ in 0..2 {
        let store = Arc::new(FileStore::open(cache_dir.path(), EvictionPolicy::unbounded()).unwrap());
        let container = Directory::new(dir.path()).with_suffixes(["tpl"]);
        let cached = CachedContainer::new(container, store, compiler.clone());
        cached.resolve("a").unwrap();
    }

    assert_eq!(compiler.calls(), 1);
}

// ===========================================================================
// Serving entry point
// ===========================================================================

#[test]
fn host_distinguishes_missing_from_broken() {
    let (dir, container) = templates();
    write_template(dir.path(), "ok.tpl", "fine", 1_000);
    fs::write(dir.path().join("bad.tpl"), [0xFFu8]).unwrap();
    let compiler: Arc<dyn Compiler> = Arc::new(PlainCompiler);
    let cached = CachedContainer::new(container, memory_store(EvictionPolicy::unbounded()), compiler.clone());
    let host = ScriptHost::new(cached, compiler, PlainExecutor);
    let env = Env::new();

    assert_eq!(host.resolve_and_execute("ok", &env).unwrap(), b"fine");
    let missing = host.resolve_and_execute("nope", &env).unwrap_err();
    assert!(matches!(missing, ResolveError::NotFound { .. }));
    assert_eq!(
        host.resolve_and_execute("bad", &env).unwrap_err().kind(),
        ResolveKind::CompileFailed
    );
    let escape = host.resolve_and_execute("../etc/passwd", &env).unwrap_err();
    assert_eq!(escape.kind(), ResolveKind::Unavailable);
    assert!(host.backend().is_cacheable());
}
