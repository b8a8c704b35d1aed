//! Error types for grinder-core
//!
//! One error enum covers the whole pipeline. Which variants are fatal is a
//! property of where they surface: catalog and configuration problems abort a
//! run before any network activity, while backend and scan failures are
//! contained by the collector or worker that hit them and only show up as
//! status metadata in the run summary.

use crate::types::Engine;
use std::time::Duration;

/// Result type alias for grinder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for grinder operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed query catalog or run configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or rejected backend credentials
    #[error("{engine} authentication failed: {message}")]
    Auth {
        /// Backend that rejected the credentials
        engine: Engine,
        /// Message reported by the backend
        message: String,
    },

    /// Backend rate limit or quota response
    #[error("{engine} rate limit: {message}")]
    RateLimit {
        /// Backend that throttled the request
        engine: Engine,
        /// Message reported by the backend
        message: String,
        /// Delay requested through `Retry-After`, if any
        retry_after: Option<Duration>,
    },

    /// Any other non-success response from a backend
    #[error("{engine} API error: {message}")]
    Backend {
        /// Backend that answered
        engine: Engine,
        /// Message reported by the backend
        message: String,
    },

    /// A scan engine invocation failed
    #[error("Scan failed: {0}")]
    ScanFailure(String),

    /// A scan task exceeded its deadline
    #[error("Scan timed out after {0:?}")]
    ScanTimeout(Duration),

    /// Every discovery backend is disabled
    #[error("No discovery backend available: {0}")]
    NoBackends(String),

    /// The run was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing failed: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::Config`]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true for errors that abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::NoBackends(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = Error::config("missing vendor");
        assert_eq!(err.to_string(), "Configuration error: missing vendor");
    }

    #[test]
    fn test_auth_error_display() {
        let err = Error::Auth {
            engine: Engine::Shodan,
            message: "invalid key".to_string(),
        };
        assert_eq!(err.to_string(), "shodan authentication failed: invalid key");
    }

    #[test]
    fn test_rate_limit_error_display() {
        let err = Error::RateLimit {
            engine: Engine::Censys,
            message: "quota exceeded".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.to_string(), "censys rate limit: quota exceeded");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err = Error::from(json_err);
        assert!(err.to_string().contains("JSON parsing failed"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::config("x").is_fatal());
        assert!(Error::NoBackends("none".into()).is_fatal());
        assert!(!Error::ScanFailure("exit 1".into()).is_fatal());
        assert!(!Error::ScanTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }
}
