//! Certificate status for device status reporting.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::lifecycle::CertificateState;

/// Snapshot of one managed certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateStatus {
    /// Config provider name.
    pub provider: String,
    /// Certificate name.
    pub name: String,
    /// Lifecycle state.
    pub state: CertificateState,
    /// `NotAfter` of the active certificate.
    pub expiration_time: Option<DateTime<Utc>>,
    /// Whole days until expiry; negative once expired.
    pub days_until_expiration: i64,
    /// Time of the last successful renewal.
    pub last_renewed: Option<DateTime<Utc>>,
    /// Successful renewals.
    pub renewal_count: u64,
    /// Message of the last recorded failure.
    pub last_error: Option<String>,
}

impl CertificateStatus {
    /// Flattens the snapshot into `<provider>/<name>.<field>` pairs.
    /// Unset timestamps and errors are omitted.
    pub fn to_key_values(&self) -> Vec<(String, String)> {
        let prefix = format!("{}/{}", self.provider, self.name);
        let field = |name: &str, value: String| (format!("{}.{}", prefix, name), value);

        let mut pairs = vec![
            field("state", self.state.to_string()),
            field("days_until_expiration", self.days_until_expiration.to_string()),
            field("renewal_count", self.renewal_count.to_string()),
        ];
        if let Some(at) = self.expiration_time {
            pairs.push(field("expiration_time", at.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(at) = self.last_renewed {
            pairs.push(field("last_renewed", at.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(err) = &self.last_error {
            pairs.push(field("last_error", err.clone()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_values() {
        let status = CertificateStatus {
            provider: "static".to_string(),
            name: "management".to_string(),
            state: CertificateState::ExpiringSoon,
            expiration_time: Some(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap()),
            days_until_expiration: 12,
            last_renewed: None,
            renewal_count: 3,
            last_error: None,
        };
        let pairs = status.to_key_values();
        assert_eq!(pairs[0], ("static/management.state".to_string(), "expiring_soon".to_string()));
        assert!(pairs.contains(&(
            "static/management.expiration_time".to_string(),
            "2030-01-02T03:04:05Z".to_string()
        )));
        assert!(!pairs.iter().any(|(k, _)| k.ends_with("last_renewed")));
        assert_eq!(pairs.len(), 4);
    }
}
