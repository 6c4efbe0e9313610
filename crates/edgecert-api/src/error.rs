//! Error types for the management API contract.

use thiserror::Error;

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors raised by management clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be delivered or the response could not be read.
    #[error("transport error: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },

    /// The service answered with a status the caller does not accept.
    #[error("unexpected status {status}: {message}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body or summary.
        message: String,
    },

    /// The named signing request does not exist.
    #[error("certificate signing request not found: {name}")]
    NotFound {
        /// Request name.
        name: String,
    },

    /// The client credential could not be used.
    #[error("invalid client credential: {reason}")]
    InvalidCredential {
        /// Description of the problem.
        reason: String,
    },

    /// Request or response body could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApiError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
