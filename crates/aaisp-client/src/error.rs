/// Classified failure of one CHAOS API call, after retries.
///
/// Bodies and messages carried here have already been scrubbed of
/// credential values.
///
/// # Examples
///
/// ```rust
/// use aaisp_client::error::CallError;
///
/// let err = CallError::HttpError { status: 503, body: "busy".to_string() };
/// assert!(err.is_transient());
/// assert_eq!(err.kind(), "http_error");
/// assert!(!CallError::AuthFailed.is_transient());
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// HTTP 401 from the API.
    #[error("CHAOS API authentication failed")]
    AuthFailed,

    /// HTTP 429. Callers should back off for the rest of the cycle.
    #[error("CHAOS API rate limited, retry after backoff")]
    RateLimited,

    /// Any other non-2xx status.
    #[error("CHAOS API HTTP error: status={status}, body={body}")]
    HttpError { status: u16, body: String },

    #[error("CHAOS API request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    NetworkError(String),

    /// The body was not a JSON object.
    #[error("Malformed CHAOS API response: {0}")]
    Malformed(String),

    /// A 2xx response carrying an `error` indicator.
    #[error("CHAOS API error: {message}")]
    Api { message: String },

    #[error("call cancelled by shutdown")]
    Cancelled,
}

impl CallError {
    /// Network errors, timeouts, 5xx and rate limiting are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            CallError::NetworkError(_) | CallError::Timeout | CallError::RateLimited => true,
            CallError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Stable, low-cardinality name used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::AuthFailed => "auth_failed",
            CallError::RateLimited => "rate_limited",
            CallError::HttpError { .. } => "http_error",
            CallError::Timeout => "timeout",
            CallError::NetworkError(_) => "network_error",
            CallError::Malformed(_) => "malformed",
            CallError::Api { .. } => "api_error",
            CallError::Cancelled => "cancelled",
        }
    }
}

/// Failure below the HTTP status layer, reported by a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, CallError>;
