use std::time::Duration;

/// Classified failure of a call to Mastodon or Telegram.
///
/// The bridge loop decides what to do from the variant: authentication
/// failures stop the process, transient failures are retried with backoff,
/// rejected requests count towards giving up on a status.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("rejected: {0}")]
    Rejected(String),
}

impl RelayError {
    pub fn transient(message: impl Into<String>) -> Self {
        RelayError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RelayError::Auth(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transient { .. })
    }

    /// Map an HTTP status returned by an API into an error class.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body.trim());
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            RelayError::Auth(message)
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            RelayError::transient(message)
        } else {
            RelayError::Rejected(message)
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => RelayError::from_status(status, &err.to_string()),
            None => RelayError::transient(err.to_string()),
        }
    }
}
