//! Error types for MCP Insider.
//!
//! Library crates use [`InsiderError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all MCP Insider operations.
#[derive(Debug, thiserror::Error)]
pub enum InsiderError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Remote fetch or enrichment call failed, or was rate limited.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The enrichment backend reported that a model does not exist.
    #[error("model unavailable: {model}")]
    ModelUnavailable { model: String },

    /// Every configured enrichment model has been marked unavailable.
    #[error("no enrichment model available")]
    ModelsExhausted,

    /// Document store read/write error.
    #[error("storage error for {key}: {message}")]
    Storage { key: String, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed input (request body, stage name, config value).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The addressed entity does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Unparseable enrichment output.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A pipeline stage could not be started.
    #[error("stage error: {0}")]
    Stage(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, InsiderError>;

/// Failure classes used when logging and when mapping errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TransientUpstream,
    ModelExhausted,
    PersistenceFailure,
    ValidationFailure,
    NotFound,
    SubprocessFailure,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientUpstream => "transient_upstream",
            Self::ModelExhausted => "model_exhausted",
            Self::PersistenceFailure => "persistence_failure",
            Self::ValidationFailure => "validation_failure",
            Self::NotFound => "not_found",
            Self::SubprocessFailure => "subprocess_failure",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InsiderError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a storage error for a document key.
    pub fn storage(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            key: key.into(),
            message: msg.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Upstream(_) | Self::ModelUnavailable { .. } | Self::Parse { .. } => {
                ErrorClass::TransientUpstream
            }
            Self::ModelsExhausted => ErrorClass::ModelExhausted,
            Self::Storage { .. } | Self::Io { .. } => ErrorClass::PersistenceFailure,
            Self::Config { .. } | Self::Validation { .. } => ErrorClass::ValidationFailure,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Stage(_) => ErrorClass::SubprocessFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = InsiderError::config("interval_hours out of range");
        assert_eq!(err.to_string(), "config error: interval_hours out of range");

        let err = InsiderError::storage("analyzed_data.json", "disk full");
        assert!(err.to_string().contains("analyzed_data.json"));
    }

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            InsiderError::Upstream("HTTP 403".into()).class(),
            ErrorClass::TransientUpstream
        );
        assert_eq!(InsiderError::ModelsExhausted.class(), ErrorClass::ModelExhausted);
        assert_eq!(
            InsiderError::io("/tmp/x", std::io::Error::other("boom")).class(),
            ErrorClass::PersistenceFailure
        );
        assert_eq!(
            InsiderError::validation("unknown stage").class(),
            ErrorClass::ValidationFailure
        );
        assert_eq!(InsiderError::not_found("x").class().as_str(), "not_found");
    }
}
