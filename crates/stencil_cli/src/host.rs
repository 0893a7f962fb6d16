//! Shared setup for CLI commands: locate the configuration and build the
//! script host over its backend hierarchy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stencil_cache::{PlainExecutor, ScriptHost};
use stencil_config::{build_backend, load_config, locate_config, Backend};
use stencil_source::{Compiler, PlainCompiler};
use tracing::debug;

use crate::GlobalArgs;

/// The host every command operates on.
pub type Host = ScriptHost<Backend, PlainExecutor>;

/// Resolves the configuration file from global CLI args.
pub fn resolve_config_path(global: &GlobalArgs) -> Result<PathBuf, Box<dyn std::error::Error>> {
    locate_config(global.config.as_deref().map(Path::new)).ok_or_else(|| {
        "no configuration found (pass --config, set STENCIL_CONFIG, or create \
         ~/.config/stencil.toml)"
            .into()
    })
}

/// Loads the configuration and builds the host.
pub fn open(global: &GlobalArgs) -> Result<Host, Box<dyn std::error::Error>> {
    let path = resolve_config_path(global)?;
    let config = load_config(&path)?;
    let compiler: Arc<dyn Compiler> = Arc::new(PlainCompiler);
    let backend = build_backend(&config, Arc::clone(&compiler))?;
    debug!(config = %path.display(), backend = backend.kind(), "host ready");
    Ok(ScriptHost::new(backend, compiler, PlainExecutor))
}

/// Runs `f` against a freshly opened host and closes it afterwards, also
/// when `f` fails.
pub fn with_host<T>(
    global: &GlobalArgs,
    f: impl FnOnce(&Host) -> Result<T, Box<dyn std::error::Error>>,
) -> Result<T, Box<dyn std::error::Error>> {
    let host = open(global)?;
    let result = f(&host);
    if let Err(e) = host.close() {
        tracing::warn!(error = %e, "failed to close backend");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use stencil_source::Container;

    fn global(config: &Path) -> GlobalArgs {
        GlobalArgs {
            quiet: true,
            verbose: false,
            config: Some(config.display().to_string()),
        }
    }

    #[test]
    fn opens_configured_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("stencil.toml");
        std::fs::write(
            &config,
            "[[backends]]\nkind = \"memory\"\n[backends.scripts]\nhi = \"Hi\"\n",
        )
        .unwrap();
        let names = with_host(&global(&config), |host| Ok(host.backend().names()?)).unwrap();
        assert_eq!(names, ["hi"]);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(&global(&dir.path().join("absent.toml"))).err().unwrap();
        assert!(err.to_string().contains("failed to read configuration"));
    }
}
