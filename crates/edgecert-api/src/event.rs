//! Renewal audit records kept by the signing service.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of renewal audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalEventType {
    /// A proactive renewal request arrived.
    RenewalStart,
    /// A proactive renewal was signed.
    RenewalSuccess,
    /// A proactive renewal was rejected or failed.
    RenewalFailed,
    /// A recovery request for an expired certificate arrived.
    RecoveryStart,
    /// A recovery was signed.
    RecoverySuccess,
    /// A recovery was rejected or failed.
    RecoveryFailed,
}

impl RenewalEventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalEventType::RenewalStart => "renewal_start",
            RenewalEventType::RenewalSuccess => "renewal_success",
            RenewalEventType::RenewalFailed => "renewal_failed",
            RenewalEventType::RecoveryStart => "recovery_start",
            RenewalEventType::RecoverySuccess => "recovery_success",
            RenewalEventType::RecoveryFailed => "recovery_failed",
        }
    }
}

impl fmt::Display for RenewalEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record of a renewal or recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRenewalEvent {
    /// Device the event concerns.
    pub device_id: String,
    /// Event kind.
    pub event_type: RenewalEventType,
    /// Renewal reason label value, or a short cause.
    pub reason: String,
    /// Expiration of the certificate being replaced, when known.
    pub old_expiration: Option<DateTime<Utc>>,
    /// Expiration of the newly issued certificate, when known.
    pub new_expiration: Option<DateTime<Utc>>,
    /// Error message for failed events.
    pub error_message: Option<String>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl CertificateRenewalEvent {
    /// Creates an event stamped with the current time.
    pub fn new(device_id: impl Into<String>, event_type: RenewalEventType, reason: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            event_type,
            reason: reason.into(),
            old_expiration: None,
            new_expiration: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        let all = [
            (RenewalEventType::RenewalStart, "renewal_start"),
            (RenewalEventType::RenewalSuccess, "renewal_success"),
            (RenewalEventType::RenewalFailed, "renewal_failed"),
            (RenewalEventType::RecoveryStart, "recovery_start"),
            (RenewalEventType::RecoverySuccess, "recovery_success"),
            (RenewalEventType::RecoveryFailed, "recovery_failed"),
        ];
        for (event_type, name) in all {
            assert_eq!(event_type.as_str(), name);
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", name));
        }
    }

    #[test]
    fn test_new_event_defaults() {
        let event = CertificateRenewalEvent::new("dev-1", RenewalEventType::RecoveryStart, "expired");
        assert_eq!(event.device_id, "dev-1");
        assert!(event.error_message.is_none());
        assert!(event.old_expiration.is_none());
        assert!(event.created_at <= Utc::now());
    }
}
