//! Error types for the certificate lifecycle engine.

use std::fmt;

use edgecert_api::ApiError;
use thiserror::Error;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, CertError>;

/// Stage of pending-certificate validation that rejected a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    /// Loading or parsing the CA bundle.
    CaBundle,
    /// Chain and signature verification against the CA bundle.
    Signature,
    /// Subject common name against the device identity.
    Identity,
    /// Validity window.
    Expiration,
    /// Private key against the certificate public key.
    KeyPair,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationStage::CaBundle => "CA bundle load failed",
            ValidationStage::Signature => "signature verification failed",
            ValidationStage::Identity => "identity verification failed",
            ValidationStage::Expiration => "expiration check failed",
            ValidationStage::KeyPair => "key pair verification failed",
        };
        f.write_str(s)
    }
}

/// Errors raised by the certificate lifecycle engine.
#[derive(Debug, Error)]
pub enum CertError {
    /// Invalid or inconsistent configuration. Never retried.
    #[error("configuration error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },

    /// A renewal threshold below zero.
    #[error("threshold days must be non-negative, got {0}")]
    InvalidThreshold(i64),

    /// A certificate without usable expiration metadata.
    #[error("certificate {name} has no expiration metadata")]
    MissingExpiration {
        /// Certificate name or subject.
        name: String,
    },

    /// A lifecycle state outside the six recognised values.
    #[error("invalid certificate state '{0}'")]
    InvalidState(String),

    /// PEM/DER parsing failure.
    #[error("failed to parse {what}: {reason}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Parser message.
        reason: String,
    },

    /// A pending certificate failed validation at a given stage.
    #[error("{stage}: {reason}")]
    Validation {
        /// Stage that failed.
        stage: ValidationStage,
        /// Description of the failure.
        reason: String,
    },

    /// Storage provider failure.
    #[error("storage error during {operation}: {reason}")]
    Storage {
        /// Storage operation name.
        operation: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// Provisioner failure.
    #[error("provisioning failed: {reason}")]
    Provision {
        /// Description of the failure.
        reason: String,
    },

    /// The signing service returned a terminal condition.
    #[error("certificate signing request {name} {condition}: {message}")]
    SigningRejected {
        /// Request name.
        name: String,
        /// `denied` or `failed`.
        condition: &'static str,
        /// Condition message.
        message: String,
    },

    /// Polling for an issued certificate ran out of attempts.
    #[error("timed out waiting for certificate signing request {name} after {attempts} attempts")]
    PollTimeout {
        /// Request name.
        name: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Neither bootstrap nor hardware attestation can authenticate recovery.
    #[error("no authentication method available for recovery")]
    NoAuthMethod,

    /// A code path that exists in the contract but has no implementation yet.
    #[error("{0} is not yet fully implemented")]
    NotImplemented(&'static str),

    /// TPM access failed.
    #[error("TPM error: {0}")]
    Tpm(String),

    /// TLS credential construction failed.
    #[error("TLS error: {reason}")]
    Tls {
        /// Description of the failure.
        reason: String,
    },

    /// Management API failure.
    #[error("management API error: {0}")]
    Api(#[from] ApiError),

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// A failure wrapped with the operation that observed it.
    #[error("{context}: {source}")]
    Context {
        /// Operation context.
        context: String,
        /// Underlying failure.
        #[source]
        source: Box<CertError>,
    },

    /// Metrics registry failure.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CertError {
    /// Wraps `self` with an operation context.
    pub fn context(self, context: impl Into<String>) -> Self {
        CertError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error in a context chain.
    pub fn root(&self) -> &CertError {
        match self {
            CertError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the failure is transient I/O or network trouble worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            CertError::Io(_) | CertError::Storage { .. } | CertError::PollTimeout { .. } => true,
            CertError::Api(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Validation stage, if this is a validation failure.
    pub fn validation_stage(&self) -> Option<ValidationStage> {
        match self.root() {
            CertError::Validation { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn validation(stage: ValidationStage, reason: impl Into<String>) -> Self {
        CertError::Validation {
            stage,
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(operation: &'static str, reason: impl fmt::Display) -> Self {
        CertError::Storage {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Adds `.context(..)` to results carrying a [`CertError`].
pub trait ResultExt<T> {
    /// Wraps the error with an operation context.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_message() {
        let err = CertError::InvalidThreshold(-1);
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_validation_stage_in_message() {
        let err = CertError::validation(ValidationStage::Signature, "unknown issuer");
        assert_eq!(err.to_string(), "signature verification failed: unknown issuer");
        assert_eq!(err.validation_stage(), Some(ValidationStage::Signature));
    }

    #[test]
    fn test_context_chain_names_full_path() {
        let err = CertError::storage("write_pending", "disk full")
            .context("renewal of management")
            .context("ensure certificate");
        let msg = err.to_string();
        assert_eq!(
            msg,
            "ensure certificate: renewal of management: storage error during write_pending: disk full"
        );
        assert!(err.is_retryable());
        assert!(matches!(err.root(), CertError::Storage { .. }));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!CertError::NoAuthMethod.is_retryable());
        assert!(!CertError::InvalidThreshold(-3).is_retryable());
        assert!(!CertError::validation(ValidationStage::KeyPair, "mismatch").is_retryable());
        assert!(CertError::Api(ApiError::Transport {
            reason: "reset".to_string()
        })
        .is_retryable());
        assert!(CertError::PollTimeout {
            name: "x".to_string(),
            attempts: 30
        }
        .is_retryable());
    }

    #[test]
    fn test_result_ext() {
        let res: Result<()> = Err(CertError::Cancelled);
        let err = res.context("poll").unwrap_err();
        assert_eq!(err.to_string(), "poll: operation cancelled");
    }
}
