//! `stencil cache`: cache maintenance.
//!
//! `clear` and `sweep` report one of three outcomes through the exit code:
//! 0 when the cache was processed, 1 when the operation failed, and 2 when
//! the configured backend has no cache.

use std::collections::BTreeSet;

use stencil_cache::CacheStore;
use stencil_config::CachedBackend;
use stencil_source::{CacheStatus, Container};

use crate::host::{with_host, Host};
use crate::{CacheCommand, GlobalArgs, ReportFormat, EXIT_ABSENT, EXIT_ERROR, EXIT_OK};

/// Runs a `stencil cache` subcommand.
pub fn run(command: &CacheCommand, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    with_host(global, |host| match command {
        CacheCommand::Clear => Ok(report(host.clear_cache(), "cleared", global)),
        CacheCommand::Sweep => Ok(report(host.sweep_cache(), "swept", global)),
        CacheCommand::Status { format } => status(host, *format),
        CacheCommand::Fetch { names } => fetch(host, names, global),
    })
}

/// Prints the outcome of a management call and maps it to an exit code.
fn report(status: CacheStatus, verb: &str, global: &GlobalArgs) -> i32 {
    match status {
        CacheStatus::Cleared { removed } => {
            if !global.quiet {
                eprintln!("{verb}: {removed} entries removed");
            }
            EXIT_OK
        }
        CacheStatus::NotACache => {
            if !global.quiet {
                eprintln!("backend is not a cache");
            }
            EXIT_ABSENT
        }
        CacheStatus::Failed(reason) => {
            eprintln!("error: {reason}");
            EXIT_ERROR
        }
    }
}

/// Occupancy of one configured cache.
struct Occupancy<'a> {
    label: &'a str,
    store: &'static str,
    entries: usize,
    bytes: u64,
}

fn occupancy(cache: &CachedBackend) -> Result<Occupancy<'_>, Box<dyn std::error::Error>> {
    let store = cache.store();
    Ok(Occupancy {
        label: cache.label(),
        store: store.kind(),
        entries: store.len()?,
        bytes: store.total_bytes()?,
    })
}

fn status(host: &Host, format: ReportFormat) -> Result<i32, Box<dyn std::error::Error>> {
    let caches = host.backend().caches();
    if caches.is_empty() {
        eprintln!("backend is not a cache");
        return Ok(EXIT_ABSENT);
    }
    let rows = caches
        .into_iter()
        .map(occupancy)
        .collect::<Result<Vec<_>, _>>()?;
    match format {
        ReportFormat::Text => {
            for row in &rows {
                println!(
                    "{}  store={} entries={} bytes={}",
                    row.label, row.store, row.entries, row.bytes
                );
            }
        }
        ReportFormat::Json => {
            let json: Vec<_> = rows
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "label": row.label,
                        "store": row.store,
                        "entries": row.entries,
                        "bytes": row.bytes,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(EXIT_OK)
}

/// Compiles `names` (or every template) into each configured cache.
///
/// Returns exit code 1 if any name could not be fetched.
fn fetch(host: &Host, names: &[String], global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let caches = host.backend().caches();
    if caches.is_empty() {
        eprintln!("backend is not a cache");
        return Ok(EXIT_ABSENT);
    }
    let mut failed = BTreeSet::new();
    let mut fetched = 0usize;
    for cache in caches {
        let wanted = if names.is_empty() {
            cache.names()?
        } else {
            names.to_vec()
        };
        for name in wanted {
            match cache.fetch(&name) {
                Ok(true) => fetched += 1,
                Ok(false) => {}
                Err(e) => {
                    eprintln!("error: {name}: {e}");
                    failed.insert(name);
                }
            }
        }
    }
    let unknown: Vec<&String> = names
        .iter()
        .filter(|n| !failed.contains(*n))
        .filter(|n| !host.backend().contains(n).unwrap_or(false))
        .collect();
    for name in &unknown {
        eprintln!("error: '{name}' not found");
    }
    if !global.quiet {
        eprintln!("fetched: {fetched} templates");
    }
    Ok(if failed.is_empty() && unknown.is_empty() {
        EXIT_OK
    } else {
        EXIT_ERROR
    })
}
