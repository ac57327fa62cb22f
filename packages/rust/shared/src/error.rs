//! Error types for oppscout.
//!
//! Library crates use [`ScoutError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all oppscout operations.
#[derive(Debug, thiserror::Error)]
pub enum ScoutError {
    /// Missing or invalid settings/files. The only fatal pipeline error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to a source or the scoring service.
    #[error("network error: {0}")]
    Network(String),

    /// Payload parsing error (HTML, JSON, dates).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Dedup store read/write error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Scoring call failed (transport, empty reply, or unparseable JSON).
    #[error("scoring error: {0}")]
    Scoring(String),

    /// A fetch capability failed or a source descriptor was rejected.
    #[error("source '{name}' failed: {message}")]
    Source { name: String, message: String },

    /// An operation exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ScoutError>;

impl ScoutError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a source error for the named source.
    pub fn source(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Source {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error aborts a pipeline run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
