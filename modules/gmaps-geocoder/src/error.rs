use thiserror::Error;

pub type Result<T> = std::result::Result<T, GeocodeError>;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("HTTP error (status {status}): {message}")]
    Http { status: u16, message: String },

    /// Non-OK `status` field in an otherwise successful response.
    #[error("Geocoding API returned {status}: {message}")]
    Api { status: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl GeocodeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GeocodeError::Network(_) | GeocodeError::Timeout(_) => true,
            GeocodeError::Http { status, .. } => *status == 429 || *status >= 500,
            GeocodeError::Api { status, .. } => {
                status == "OVER_QUERY_LIMIT" || status == "UNKNOWN_ERROR"
            }
            GeocodeError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for GeocodeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GeocodeError::Timeout(err.to_string())
        } else if err.is_decode() {
            GeocodeError::Parse(err.to_string())
        } else {
            GeocodeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GeocodeError {
    fn from(err: serde_json::Error) -> Self {
        GeocodeError::Parse(err.to_string())
    }
}
