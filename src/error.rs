use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RedditError>;

#[derive(Debug, Error)]
pub enum RedditError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by Reddit")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error (status {status})")]
    Server { status: u16 },

    #[error("Bearer token rejected, re-authenticating")]
    TokenExpired,

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<RedditError>,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl RedditError {
    /// Errors that are expected to clear up on their own if the request is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RedditError::Network(_)
                | RedditError::RateLimited { .. }
                | RedditError::Server { .. }
                | RedditError::TokenExpired
        )
    }

    pub(crate) fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => RedditError::RateLimited { retry_after },
            401 => RedditError::TokenExpired,
            404 => RedditError::NotFound(message),
            s if s >= 500 => RedditError::Server { status: s },
            s => RedditError::Api { status: s, message },
        }
    }
}

impl From<reqwest::Error> for RedditError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RedditError::Parse(err.to_string())
        } else {
            RedditError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RedditError {
    fn from(err: serde_json::Error) -> Self {
        RedditError::Parse(err.to_string())
    }
}
