use std::fmt;

use thiserror::Error;

/// Application-wide error types for trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// An operation exceeded its deadline.
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The data source asked us to slow down.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// An extraction came back with nothing in it.
    #[error("Empty result: {0}")]
    EmptyResult(String),

    /// Retry budget spent. Carries the final underlying error.
    #[error("Giving up after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        attempts: u32,
        last_error: Box<AppError>,
    },

    /// No healthy proxy endpoint is left in the pool.
    #[error("No healthy proxy available")]
    ProxyUnavailable,

    /// A proxy source entry could not be normalised into an endpoint.
    #[error("Invalid proxy '{input}': {reason}")]
    InvalidProxy { input: String, reason: String },

    /// Dataset names double as directory names and are restricted.
    #[error("Invalid dataset name '{0}'")]
    InvalidDatasetName(String),

    /// Storage backend read/write failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// CSV export failed.
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error. Classified by message when deciding on retries.
    #[error("{0}")]
    Generic(String),
}

/// Coarse classification of an error for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    Network,
    RateLimit,
    EmptyResult,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network-error",
            ErrorKind::RateLimit => "rate-limit",
            ErrorKind::EmptyResult => "empty-result",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Classify free text by well-known patterns. Anything unrecognised is `Unknown`.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("timeout") || msg.contains("timed out") {
            ErrorKind::Timeout
        } else if msg.contains("net::")
            || msg.contains("econnrefused")
            || msg.contains("econnreset")
            || msg.contains("network")
        {
            ErrorKind::Network
        } else if msg.contains("rate limit") || msg.contains("429") {
            ErrorKind::RateLimit
        } else if msg.contains("empty") || msg.contains("no results") {
            ErrorKind::EmptyResult
        } else {
            ErrorKind::Unknown
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl AppError {
    /// Classify this error for the retry policy.
    ///
    /// Typed variants map directly; free-text variants fall back to
    /// message-pattern matching.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::NetworkError(_) => ErrorKind::Network,
            AppError::RateLimitExceeded => ErrorKind::RateLimit,
            AppError::EmptyResult(_) => ErrorKind::EmptyResult,
            AppError::Generic(msg) => ErrorKind::from_message(msg),
            _ => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable_by_default(&self) -> bool {
        self.kind() != ErrorKind::Unknown
    }

    pub(crate) fn storage(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        AppError::Storage(format!("{context}: {err}"))
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::CsvError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_variants_classify_directly() {
        assert_eq!(AppError::Timeout(500).kind(), ErrorKind::Timeout);
        assert_eq!(
            AppError::NetworkError("reset".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(AppError::RateLimitExceeded.kind(), ErrorKind::RateLimit);
        assert_eq!(
            AppError::EmptyResult("page 3".into()).kind(),
            ErrorKind::EmptyResult
        );
        assert_eq!(AppError::ProxyUnavailable.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_generic_messages_classify_by_pattern() {
        let cases = [
            ("Navigation Timeout exceeded", ErrorKind::Timeout),
            ("net::ERR_CONNECTION_CLOSED", ErrorKind::Network),
            ("connect ECONNREFUSED 127.0.0.1:9222", ErrorKind::Network),
            ("Rate limit hit, slow down", ErrorKind::RateLimit),
            ("HTTP 429 Too Many Requests", ErrorKind::RateLimit),
            ("selector returned empty list", ErrorKind::EmptyResult),
            ("No results found", ErrorKind::EmptyResult),
            ("cannot read property 'text' of undefined", ErrorKind::Unknown),
        ];
        for (msg, expected) in cases {
            assert_eq!(AppError::Generic(msg.into()).kind(), expected, "{msg}");
        }
    }

    #[test]
    fn test_infrastructure_errors_are_not_retryable() {
        assert!(!AppError::Storage("disk full".into()).is_retryable_by_default());
        assert!(!AppError::InvalidDatasetName("..".into()).is_retryable_by_default());
        assert!(AppError::Timeout(1).is_retryable_by_default());
    }

    #[test]
    fn test_exhausted_retries_display_includes_cause() {
        let err = AppError::ExhaustedRetries {
            attempts: 4,
            last_error: Box::new(AppError::RateLimitExceeded),
        };
        assert_eq!(
            err.to_string(),
            "Giving up after 4 attempts: Rate limit exceeded"
        );
    }
}
