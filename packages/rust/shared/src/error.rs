//! Error types for DealDriver.
//!
//! Library crates use [`DealDriverError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! The pipeline treats the variants differently:
//! - [`DealDriverError::StageFailure`] is captured into a failure artifact and
//!   downstream stages continue with degraded input.
//! - [`DealDriverError::RateLimitTimeout`] is retried a bounded number of
//!   times before it becomes a stage failure.
//! - [`DealDriverError::ResourceExhausted`] makes the caller fall back to an
//!   unpooled session.
//! - [`DealDriverError::Storage`] and [`DealDriverError::DependencyMissing`]
//!   surface to the orchestrator, which marks the item failed.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all DealDriver operations.
#[derive(Debug, thiserror::Error)]
pub enum DealDriverError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while scraping or talking to an external API.
    #[error("network error: {0}")]
    Network(String),

    /// HTML or response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Artifact store or spool write/read failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// AI analysis error (API, or response parsing).
    #[error("analysis error: {0}")]
    Analysis(String),

    /// CRM request error.
    #[error("crm error: {0}")]
    Crm(String),

    /// Message broker error.
    #[error("broker error: {0}")]
    Broker(String),

    /// Session pool at capacity and no handle was released before the timeout.
    #[error("resource exhausted: {resource} (waited {waited:?})")]
    ResourceExhausted { resource: String, waited: Duration },

    /// No rate-limit tokens became available before the timeout.
    #[error("rate limit timeout on {resource} after {waited:?}")]
    RateLimitTimeout { resource: String, waited: Duration },

    /// A stage's collaborator failed; recorded in the stage artifact.
    #[error("{stage} failed: {message}")]
    StageFailure { stage: String, message: String },

    /// A stage was invoked before its upstream artifact existed.
    #[error("{stage} for {item} requires the {upstream} artifact, which does not exist")]
    DependencyMissing {
        item: String,
        stage: String,
        upstream: String,
    },

    /// The operation was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad domain, invalid argument, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DealDriverError>;

impl DealDriverError {
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

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a stage failure for the named stage.
    pub fn stage_failure(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Errors the orchestrator treats as fatal for a single work item.
    pub fn is_item_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Io { .. } | Self::DependencyMissing { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DealDriverError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = DealDriverError::RateLimitTimeout {
            resource: "ai-api".into(),
            waited: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("ai-api"));

        let err = DealDriverError::DependencyMissing {
            item: "acme.com".into(),
            stage: "enrich_company".into(),
            upstream: "scrape".into(),
        };
        assert!(err.to_string().contains("requires the scrape artifact"));
    }

    #[test]
    fn fatal_classification() {
        assert!(DealDriverError::Storage("disk full".into()).is_item_fatal());
        assert!(!DealDriverError::stage_failure("scrape", "timeout").is_item_fatal());
        assert!(DealDriverError::Cancelled.is_cancelled());
    }
}
