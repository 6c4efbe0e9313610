//! Certificate signing request resource.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Label carrying renewal intent on a signing request.
pub const RENEWAL_REASON_LABEL: &str = "flightctl.io/renewal-reason";

/// Why a device is asking for a replacement certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenewalReason {
    /// The current certificate is still valid but close to expiry.
    Proactive,
    /// The current certificate has expired; the request is a recovery.
    Expired,
}

impl RenewalReason {
    /// Label value for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalReason::Proactive => "proactive",
            RenewalReason::Expired => "expired",
        }
    }
}

impl fmt::Display for RenewalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenewalReason {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proactive" => Ok(RenewalReason::Proactive),
            "expired" => Ok(RenewalReason::Expired),
            other => Err(ApiError::UnexpectedStatus {
                status: 400,
                message: format!("unknown renewal reason '{}'", other),
            }),
        }
    }
}

/// Kind of a status condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    /// The request was approved for signing.
    Approved,
    /// The request was rejected. Terminal.
    Denied,
    /// Signing failed. Terminal.
    Failed,
}

/// A status condition on a signing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition kind.
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// Whether the condition holds.
    pub status: bool,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
}

impl Condition {
    /// Creates a condition that holds.
    pub fn new(condition_type: ConditionType, reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition_type,
            status: true,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Desired state of a signing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSigningRequestSpec {
    /// PEM-encoded PKCS#10 request.
    pub request: String,
    /// Signer that should handle the request.
    pub signer_name: String,
    /// Requested certificate lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_seconds: Option<u64>,
    /// TPM attestation accompanying a hardware-rooted recovery request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<serde_json::Value>,
}

/// Observed state of a signing request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSigningRequestStatus {
    /// PEM-encoded certificate once issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// Status conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A certificate signing request resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSigningRequest {
    /// Resource name, assigned by the caller.
    pub name: String,
    /// Resource labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Request spec.
    pub spec: CertificateSigningRequestSpec,
    /// Request status.
    #[serde(default)]
    pub status: CertificateSigningRequestStatus,
}

impl CertificateSigningRequest {
    /// Creates a request for the given CSR PEM.
    pub fn new(name: impl Into<String>, request_pem: impl Into<String>, signer_name: &str) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            spec: CertificateSigningRequestSpec {
                request: request_pem.into(),
                signer_name: signer_name.to_string(),
                expiration_seconds: None,
                attestation: None,
            },
            status: CertificateSigningRequestStatus::default(),
        }
    }

    /// Attaches the renewal-reason label.
    pub fn with_renewal_reason(mut self, reason: RenewalReason) -> Self {
        self.labels
            .insert(RENEWAL_REASON_LABEL.to_string(), reason.as_str().to_string());
        self
    }

    /// Returns the renewal reason if the label is present and well-formed.
    pub fn renewal_reason(&self) -> Option<RenewalReason> {
        self.labels
            .get(RENEWAL_REASON_LABEL)
            .and_then(|v| v.parse().ok())
    }

    /// Whether the given condition is present and true.
    pub fn has_condition(&self, condition_type: ConditionType) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.condition_type == condition_type && c.status)
    }

    /// Returns the condition of the given type, if any.
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Whether the request can no longer produce a certificate.
    pub fn is_terminal_failure(&self) -> bool {
        self.has_condition(ConditionType::Denied) || self.has_condition(ConditionType::Failed)
    }

    /// Sets or replaces a condition.
    pub fn set_condition(&mut self, condition: Condition) {
        self.status
            .conditions
            .retain(|c| c.condition_type != condition.condition_type);
        self.status.conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CertificateSigningRequest {
        CertificateSigningRequest::new("dev-1-renewal", "-----BEGIN CERTIFICATE REQUEST-----", "edgecert.io/device-management")
    }

    #[test]
    fn test_renewal_label_round_trip() {
        let csr = sample().with_renewal_reason(RenewalReason::Expired);
        assert_eq!(csr.labels.get(RENEWAL_REASON_LABEL).map(String::as_str), Some("expired"));
        assert_eq!(csr.renewal_reason(), Some(RenewalReason::Expired));
    }

    #[test]
    fn test_missing_or_bogus_label() {
        let mut csr = sample();
        assert_eq!(csr.renewal_reason(), None);
        csr.labels
            .insert(RENEWAL_REASON_LABEL.to_string(), "whenever".to_string());
        assert_eq!(csr.renewal_reason(), None);
    }

    #[test]
    fn test_terminal_conditions() {
        let mut csr = sample();
        assert!(!csr.is_terminal_failure());

        csr.set_condition(Condition::new(ConditionType::Approved, "AutoApproved", "ok"));
        assert!(csr.has_condition(ConditionType::Approved));
        assert!(!csr.is_terminal_failure());

        csr.set_condition(Condition::new(ConditionType::Denied, "IdentityMismatch", "no"));
        assert!(csr.is_terminal_failure());
    }

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut csr = sample();
        csr.set_condition(Condition::new(ConditionType::Failed, "First", "a"));
        csr.set_condition(Condition::new(ConditionType::Failed, "Second", "b"));
        assert_eq!(csr.status.conditions.len(), 1);
        assert_eq!(csr.condition(ConditionType::Failed).map(|c| c.reason.as_str()), Some("Second"));
    }

    #[test]
    fn test_json_shape() {
        let csr = sample().with_renewal_reason(RenewalReason::Proactive);
        let json = serde_json::to_value(&csr).unwrap();
        assert_eq!(json["labels"][RENEWAL_REASON_LABEL], "proactive");
        assert!(json["spec"].get("attestation").is_none());
        let decoded: CertificateSigningRequest = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, csr);
    }
}
