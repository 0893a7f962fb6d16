//! Configuration file discovery, loading, and validation.

use crate::error::ConfigError;
use crate::types::{BackendSpec, StencilConfig, StoreKind};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "STENCIL_CONFIG";

/// System-wide configuration file, consulted last.
pub const SYSTEM_CONFIG: &str = "/etc/stencil.toml";

/// Finds the configuration file to use.
///
/// The search order is `explicit`, the `STENCIL_CONFIG` environment
/// variable, `~/.config/stencil.toml`, and finally `/etc/stencil.toml`.
/// Explicit and environment paths are returned even if they do not exist so
/// that loading reports the problem; the fallbacks are used only if present.
pub fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    let mut fallbacks = Vec::with_capacity(2);
    if let Some(home) = dirs::home_dir() {
        fallbacks.push(home.join(".config").join("stencil.toml"));
    }
    fallbacks.push(PathBuf::from(SYSTEM_CONFIG));
    locate_in(explicit, std::env::var_os(CONFIG_ENV), &fallbacks)
}

fn locate_in(
    explicit: Option<&Path>,
    env: Option<OsString>,
    fallbacks: &[PathBuf],
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    fallbacks.iter().find(|p| p.is_file()).cloned()
}

/// Loads and validates a configuration file.
///
/// Relative backend and cache paths are resolved against the file's
/// directory.
pub fn load_config(path: &Path) -> Result<StencilConfig, ConfigError> {
    debug!(path = %path.display(), "loading configuration");
    let content = std::fs::read_to_string(path)?;
    let mut config = parse(&content)?;
    let base = path.parent().filter(|p| !p.as_os_str().is_empty());
    normalize_paths(&mut config, base);
    validate_config(&config)?;
    Ok(config)
}

/// Parses and validates a configuration from a string.
///
/// Relative paths are left relative to the working directory.
pub fn load_config_from_str(content: &str) -> Result<StencilConfig, ConfigError> {
    let mut config = parse(content)?;
    normalize_paths(&mut config, None);
    validate_config(&config)?;
    Ok(config)
}

fn parse(content: &str) -> Result<StencilConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Expands a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn normalize(path: &mut PathBuf, base: Option<&Path>) {
    let expanded = expand_tilde(path);
    *path = match base {
        Some(base) if expanded.is_relative() => base.join(expanded),
        _ => expanded,
    };
}

fn normalize_paths(config: &mut StencilConfig, base: Option<&Path>) {
    for backend in &mut config.backends {
        match backend {
            BackendSpec::Directory(dir) => normalize(&mut dir.path, base),
            BackendSpec::Archive(archive) => normalize(&mut archive.path, base),
            BackendSpec::Cache(cache) => {
                if let Some(directory) = &mut cache.directory {
                    normalize(directory, base);
                }
            }
            BackendSpec::Memory(_) => {}
        }
    }
}

/// Validates that required fields are present and the hierarchy is well formed.
fn validate_config(config: &StencilConfig) -> Result<(), ConfigError> {
    if config.backends.is_empty() {
        return Err(ConfigError::MissingField("backends".to_string()));
    }
    if let Some(BackendSpec::Cache(_)) = config.backends.first() {
        return Err(ConfigError::ValidationError(
            "backends[0]: a cache must follow the backends it decorates".to_string(),
        ));
    }
    for (index, backend) in config.backends.iter().enumerate() {
        match backend {
            BackendSpec::Directory(dir) if dir.path.as_os_str().is_empty() => {
                return Err(ConfigError::MissingField(format!("backends[{index}].path")));
            }
            BackendSpec::Archive(archive) if archive.path.as_os_str().is_empty() => {
                return Err(ConfigError::MissingField(format!("backends[{index}].path")));
            }
            BackendSpec::Cache(cache) => {
                if cache.store == StoreKind::Files && cache.directory.is_none() {
                    return Err(ConfigError::MissingField(format!(
                        "backends[{index}].directory"
                    )));
                }
                if cache.shards == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "backends[{index}].shards must be positive"
                    )));
                }
                if cache.wait_timeout_secs == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "backends[{index}].wait_timeout_secs must be positive"
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
