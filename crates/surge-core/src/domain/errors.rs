//! Error taxonomy for calls against the external service.

use thiserror::Error;

/// Operational classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry locally and shrink the admission limit.
    Backpressure,
    /// Retry locally (timeouts, 5xx, connection resets).
    Transient,
    /// Route to the failure sink immediately; retrying cannot help.
    Unrecoverable,
}

/// Failure of one call to the external service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("rate limited by external service")]
    RateLimited,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("unrecoverable failure: {0}")]
    Unrecoverable(String),
}

impl ServiceError {
    /// Map a non-success HTTP status to the taxonomy.
    ///
    /// Returns `None` for 2xx.
    pub fn from_status(status: u16, body: &str) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(ServiceError::RateLimited),
            408 => Some(ServiceError::Transient(format!("HTTP 408: {body}"))),
            500..=599 => Some(ServiceError::Transient(format!("HTTP {status}: {body}"))),
            _ => Some(ServiceError::Unrecoverable(format!("HTTP {status}: {body}"))),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::RateLimited => ErrorKind::Backpressure,
            ServiceError::Transient(_) => ErrorKind::Transient,
            ServiceError::Unrecoverable(_) => ErrorKind::Unrecoverable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Unrecoverable
    }
}
