//! Error types for previewd
//!
//! All modules use `PreviewResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for previewd operations
pub type PreviewResult<T> = Result<T, PreviewError>;

/// All errors that can occur in previewd
#[derive(Error, Debug)]
pub enum PreviewError {
    // Request errors
    #[error("{0}")]
    Validation(String),

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Request body too large")]
    BodyTooLarge,

    // Build errors
    #[error("Build failed for {digest}:\n{reason}")]
    Build { digest: String, reason: String },

    #[error("Failed to start bundler `{command}`: {source}")]
    BundlerSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bundler timed out after {secs}s for {digest}:\n{output}")]
    BuildTimeout {
        digest: String,
        secs: u64,
        output: String,
    },

    #[error("Build cancelled for {0}")]
    BuildCancelled(String),

    #[error("Bundler output missing: {0}")]
    OutputMissing(PathBuf),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Cache errors
    #[error("Cache entry not found: {0}")]
    CacheEntryNotFound(String),

    #[error("Invalid content digest: {0}")]
    InvalidDigest(String),

    // IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Server(String),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PreviewError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a build failure carrying the bundler diagnostics
    pub fn build(digest: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Build {
            digest: digest.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status code used when this error terminates a request
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::InvalidBody(_) | Self::InvalidDigest(_) => 400,
            Self::BodyTooLarge => 413,
            _ => 500,
        }
    }

    /// Whether the error came from the bundler rather than our own filesystem work
    pub fn is_build_failure(&self) -> bool {
        matches!(
            self,
            Self::Build { .. }
                | Self::BundlerSpawn { .. }
                | Self::BuildTimeout { .. }
                | Self::BuildCancelled(_)
                | Self::OutputMissing(_)
        )
    }

    /// Whether this is a filesystem error for a path that no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::BundlerSpawn { .. } => {
                Some("Check [bundler] program in config and that it is on PATH")
            }
            Self::BuildTimeout { .. } => Some("Raise [bundler] timeout_secs in config"),
            Self::ConfigInvalid { .. } => Some("Run: previewd config show"),
            _ => None,
        }
    }
}
