//! Error types for the connectivity tracker.
//!
//! Transport failures never reach the consumer of the connectivity stream:
//! they are retried or turned into a `false` reading. These errors travel
//! between the internal layers (endpoint, watcher, state machine, tracker).

use thiserror::Error;

/// Main error type for the connectivity library.
#[derive(Debug, Error)]
pub enum ConnError {
    // Bus errors
    #[error("Bus error: {message}")]
    Bus {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Failed to watch {member}: {message}")]
    WatchFailed { member: String, message: String },

    #[error("Watch on {member} closed")]
    WatchClosed { member: String },

    #[error("Unexpected value for {what}: expected {expected}, got {actual}")]
    UnexpectedValue {
        what: String,
        expected: &'static str,
        actual: String,
    },

    // Network errors
    #[error("HTTP error: {message}")]
    Http {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Request timed out")]
    Timeout,

    // Retry errors
    #[error("Gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Operation was cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for connectivity operations.
pub type Result<T> = std::result::Result<T, ConnError>;

impl From<std::io::Error> for ConnError {
    fn from(err: std::io::Error) -> Self {
        ConnError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ConnError {
    fn from(err: serde_json::Error) -> Self {
        ConnError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ConnError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnError::Timeout
        } else {
            ConnError::Http {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl From<url::ParseError> for ConnError {
    fn from(err: url::ParseError) -> Self {
        ConnError::Config {
            message: format!("invalid URL: {}", err),
        }
    }
}

impl ConnError {
    /// Shorthand for a bus failure without a separate cause.
    pub fn bus(message: impl Into<String>) -> Self {
        ConnError::Bus {
            message: message.into(),
            cause: None,
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        ConnError::Config {
            message: message.into(),
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnError::Bus { .. }
                | ConnError::WatchFailed { .. }
                | ConnError::Http { .. }
                | ConnError::Timeout
        )
    }
}
