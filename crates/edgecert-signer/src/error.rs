//! Error types for the signing service.

use thiserror::Error;

/// Result type alias for signing-service operations.
pub type Result<T> = std::result::Result<T, SignerError>;

/// Errors raised by the signing service.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The request or one of its inputs could not be parsed.
    #[error("malformed request: {reason}")]
    Malformed {
        /// Description of the problem.
        reason: String,
    },

    /// The caller may not create this request.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// Description of the problem.
        reason: String,
    },

    /// No request with this name exists.
    #[error("certificate signing request not found: {name}")]
    NotFound {
        /// Request name.
        name: String,
    },

    /// A request with this name already exists.
    #[error("certificate signing request already exists: {name}")]
    AlreadyExists {
        /// Request name.
        name: String,
    },

    /// The CA failed to produce a certificate.
    #[error("signing failed: {reason}")]
    Signing {
        /// Description of the failure.
        reason: String,
    },
}

impl SignerError {
    /// HTTP status the service answers with.
    pub fn status(&self) -> u16 {
        match self {
            SignerError::Malformed { .. } => 400,
            SignerError::Forbidden { .. } => 403,
            SignerError::NotFound { .. } => 404,
            SignerError::AlreadyExists { .. } => 409,
            SignerError::Signing { .. } => 500,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        SignerError::Malformed {
            reason: reason.into(),
        }
    }

    pub(crate) fn signing(reason: impl std::fmt::Display) -> Self {
        SignerError::Signing {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(SignerError::malformed("bad pem").status(), 400);
        assert_eq!(
            SignerError::Forbidden {
                reason: "no peer".to_string()
            }
            .status(),
            403
        );
        assert_eq!(SignerError::signing("boom").status(), 500);
        assert_eq!(
            SignerError::NotFound {
                name: "x".to_string()
            }
            .to_string(),
            "certificate signing request not found: x"
        );
    }
}
