use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No credential available: {0}")]
    NoCredentials(String),

    #[error("Remote directory is not configured")]
    NotConfigured,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Rate limited: {retry_after:?}")]
    RateLimit { retry_after: Option<u64> },

    #[error("Remote API error: {status} {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Unexpected response shape: {0}")]
    Decode(String),

    #[error("Operation not supported by this directory API: {0}")]
    Unsupported(&'static str),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl GraphError {
    /// Whether the HTTP layer should retry the request on its own
    pub fn is_retryable(&self) -> bool {
        match self {
            GraphError::Network(e) => !e.is_decode(),
            GraphError::Api { status, .. } if *status >= 500 => true,
            GraphError::RateLimit { .. } => true,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GraphError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Structured error code reported by the remote API, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            GraphError::Api { code, .. } if !code.is_empty() => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GraphError::Api { status, .. } => Some(*status),
            GraphError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Transport or shape failure, as opposed to an answer from the remote API
    pub fn is_transport_or_decode(&self) -> bool {
        matches!(
            self,
            GraphError::Network(_) | GraphError::Json(_) | GraphError::Decode(_)
        )
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        GraphError::Decode(message.into())
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_is_exposed_for_api_errors() {
        let error = GraphError::Api {
            status: 404,
            code: "Request_ResourceNotFound".to_string(),
            message: "Resource 'abc' does not exist".to_string(),
        };
        assert_eq!(error.code(), Some("Request_ResourceNotFound"));
        assert!(error.is_not_found());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_empty_code_is_none() {
        let error = GraphError::Api {
            status: 400,
            code: String::new(),
            message: "bad".to_string(),
        };
        assert_eq!(error.code(), None);
    }

    #[test]
    fn test_decode_counts_as_transport_failure() {
        assert!(GraphError::decode("missing value").is_transport_or_decode());
        assert!(!GraphError::NotConfigured.is_transport_or_decode());
    }
}
