//! Error types for configuration loading and backend construction.

/// Errors that can occur when loading a `stencil.toml` configuration or
/// building the backend it describes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An I/O error occurred while reading the configuration file.
    #[error("failed to read configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A required field is missing from the configuration.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A configured backend could not be opened.
    #[error("backends[{index}] ({kind}): {reason}")]
    Backend {
        /// Position of the backend in the `backends` list.
        index: usize,
        /// The backend's `kind` tag.
        kind: &'static str,
        /// Description of the failure.
        reason: String,
    },
}
