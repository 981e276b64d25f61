//! LXD client errors

use thiserror::Error;

/// Errors that can occur when talking to an LXD server
#[derive(Debug, Error)]
pub enum LxdError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// LXD returned an error envelope
    #[error("LXD API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Background operation finished unsuccessfully
    #[error("LXD operation failed: {0}")]
    Operation(String),

    /// Client certificate or key could not be loaded
    #[error("Invalid client credentials: {0}")]
    Credentials(String),
}

impl LxdError {
    /// Whether retrying the same call later can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            LxdError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LxdError::Api { code, .. } => *code == 409 || *code == 429 || *code >= 500,
            LxdError::Operation(_) => true,
            LxdError::Serialization(_) | LxdError::Credentials(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        assert!(LxdError::Api { code: 503, message: "busy".into() }.is_transient());
        assert!(LxdError::Api { code: 409, message: "conflict".into() }.is_transient());
        assert!(!LxdError::Api { code: 400, message: "bad".into() }.is_transient());
        assert!(!LxdError::Credentials("no key".into()).is_transient());
    }
}
