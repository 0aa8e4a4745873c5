use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphApiError>;

#[derive(Debug, Error)]
pub enum GraphApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl GraphApiError {
    /// Transport failures, timeouts and 5xx responses are worth another attempt.
    /// Rate limiting is handled separately by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            GraphApiError::Network(_) | GraphApiError::Timeout(_) => true,
            GraphApiError::Api { status, .. } => *status >= 500,
            GraphApiError::RateLimited { .. } | GraphApiError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for GraphApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GraphApiError::Timeout(err.to_string())
        } else if err.is_decode() {
            GraphApiError::Parse(err.to_string())
        } else {
            GraphApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GraphApiError {
    fn from(err: serde_json::Error) -> Self {
        GraphApiError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        assert!(GraphApiError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(!GraphApiError::Api { status: 404, message: String::new() }.is_retryable());
        assert!(GraphApiError::Network("reset".into()).is_retryable());
        assert!(!GraphApiError::RateLimited { retry_after: None }.is_retryable());
    }
}
