//! Shared error and result types
//!
//! The error enum mirrors the wire-level taxonomy: validation and quota
//! failures are detected before any upstream call and carry full detail,
//! upstream failures are surfaced opaquely, and trigger-driven components
//! log instead of propagating.

use std::time::Duration;
use thiserror::Error;

/// Rookery error taxonomy
#[derive(Debug, Error)]
pub enum RookeryError {
    /// Caller identity is missing
    #[error("authentication required")]
    Unauthenticated,

    /// Malformed request payload
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Quota exhausted; cooldown window still active
    #[error("quota exhausted, retry in {}s", retry_after.as_secs())]
    ResourceExhausted {
        capability: String,
        retry_after: Duration,
    },

    /// Referenced record or account does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream dependency failed terminally (retries exhausted or fatal).
    /// Provider-specific detail stays in the logs, not on the wire.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Datastore failure
    #[error("database error: {0}")]
    Database(String),

    /// Unexpected condition
    #[error("internal error: {0}")]
    Internal(String),
}

impl RookeryError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            RookeryError::Unauthenticated => 401,
            RookeryError::InvalidArgument(_) => 400,
            RookeryError::ResourceExhausted { .. } => 429,
            RookeryError::NotFound(_) => 404,
            RookeryError::Upstream(_) => 502,
            RookeryError::Database(_) | RookeryError::Internal(_) => 500,
        }
    }

    /// Message safe to return to clients. Quota errors keep their wait
    /// estimate; everything upstream/internal collapses to a generic line.
    pub fn public_message(&self) -> String {
        match self {
            RookeryError::Unauthenticated
            | RookeryError::InvalidArgument(_)
            | RookeryError::ResourceExhausted { .. }
            | RookeryError::NotFound(_) => self.to_string(),
            RookeryError::Upstream(_) => "upstream service unavailable".to_string(),
            RookeryError::Database(_) | RookeryError::Internal(_) => {
                "internal error".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, RookeryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RookeryError::Unauthenticated.status_code(), 401);
        assert_eq!(
            RookeryError::ResourceExhausted {
                capability: "identification".into(),
                retry_after: Duration::from_secs(60),
            }
            .status_code(),
            429
        );
        assert_eq!(RookeryError::Upstream("x".into()).status_code(), 502);
    }

    #[test]
    fn test_public_message_hides_internals() {
        let err = RookeryError::Upstream("provider leaked a token: abc123".into());
        assert_eq!(err.public_message(), "upstream service unavailable");

        let err = RookeryError::Database("connection refused".into());
        assert_eq!(err.public_message(), "internal error");
    }
}
