use thiserror::Error;

use crate::rate_limiter::RateLimitError;

/// Errors that can occur when talking to the remote issue tracker.
///
/// Classification drives the caller's reaction: transient failures are
/// retried with backoff, `NotFound` fails only the affected item, and
/// connectivity-class failures abort the rest of an operation.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Invalid or expired credentials (HTTP 401/403). Not retried.
    #[error("authentication failed ({status}): {body}")]
    Authentication { status: u16, body: String },

    /// 5xx, 429, or a timed-out request. Eligible for bounded retry.
    #[error("transient tracker error ({status:?}): {message}")]
    Transient {
        /// HTTP status, absent for transport timeouts.
        status: Option<u16>,
        message: String,
        /// Server-provided `Retry-After`, in seconds.
        retry_after_secs: Option<u64>,
    },

    /// The referenced issue or project does not exist (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-2xx response.
    #[error("tracker returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    /// The tracker could not be reached at all.
    #[error("cannot reach tracker: {0}")]
    Connection(String),

    /// The call's cancellation signal fired before a request was issued.
    #[error("request cancelled")]
    Cancelled,

    /// The response body did not match the expected shape.
    #[error("failed to decode tracker response: {0}")]
    Decode(String),

    /// Credentials could not be (re)loaded from the secret store.
    #[error("credentials: {0}")]
    Credentials(#[from] im_core::credentials::CredentialError),
}

/// Result type alias for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

impl SourceError {
    /// Eligible for retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }

    /// The tracker cannot be used at all; sibling work is pointless.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SourceError::Connection(_) | SourceError::Authentication { .. } | SourceError::Credentials(_)
        )
    }

    /// Map a non-2xx status and body to the taxonomy.
    pub fn from_status(status: u16, body: String, retry_after_secs: Option<u64>) -> Self {
        match status {
            401 | 403 => SourceError::Authentication { status, body },
            404 => SourceError::NotFound(body),
            429 | 500..=599 => SourceError::Transient {
                status: Some(status),
                message: body,
                retry_after_secs,
            },
            _ => SourceError::Api { status, body },
        }
    }
}

impl From<RateLimitError> for SourceError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::Cancelled => SourceError::Cancelled,
            RateLimitError::Exceeded { retry_after } => SourceError::Transient {
                status: None,
                message: e.to_string(),
                retry_after_secs: Some(retry_after.as_secs()),
            },
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Transient {
                status: None,
                message: e.to_string(),
                retry_after_secs: None,
            }
        } else if e.is_connect() {
            SourceError::Connection(e.to_string())
        } else if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else {
            SourceError::Transient {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
                retry_after_secs: None,
            }
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Decode(e.to_string())
    }
}
