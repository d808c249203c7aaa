use thiserror::Error;

/// Failure talking to the message source or the completion API
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API rejected request: {0}")]
    Api(String),

    #[error("Empty response from completion API")]
    EmptyCompletion,
}

impl ClientError {
    /// Rate limits, server errors and dropped connections clear up on their own
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ClientError::Status { status, .. } => *status == 429 || *status >= 500,
            ClientError::Api(_) | ClientError::EmptyCompletion => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let status = |status| ClientError::Status {
            status,
            body: String::new(),
        };

        assert!(status(429).is_transient());
        assert!(status(502).is_transient());
        assert!(!status(400).is_transient());
        assert!(!status(401).is_transient());
        assert!(!ClientError::EmptyCompletion.is_transient());
    }
}
