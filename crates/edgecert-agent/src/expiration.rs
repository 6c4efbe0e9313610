//! Expiration arithmetic for managed certificates.
//!
//! All comparisons are made in UTC. Day counts truncate toward zero, so a
//! certificate that expires in 23h59m has 0 days left and one that expired
//! 10 days and a few minutes ago has -10.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{CertError, Result};
use crate::x509::CertificateData;

const SECS_PER_HOUR: i64 = 3600;
const HOURS_PER_DAY: i64 = 24;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Converts certificate `NotAfter` values into expiry decisions.
#[derive(Clone)]
pub struct ExpirationMonitor {
    clock: Clock,
}

impl fmt::Debug for ExpirationMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpirationMonitor").finish_non_exhaustive()
    }
}

impl Default for ExpirationMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpirationMonitor {
    /// Creates a monitor reading the system clock.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Utc::now),
        }
    }

    /// Creates a monitor with a custom clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self { clock }
    }

    /// Current time according to the monitor's clock.
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Whole days from now until `not_after`, truncated toward zero.
    pub fn days_until(&self, not_after: DateTime<Utc>) -> i64 {
        let remaining = not_after - self.now();
        remaining.num_seconds() / SECS_PER_HOUR / HOURS_PER_DAY
    }

    /// Whole days until the certificate expires; negative once expired.
    pub fn calculate_days_until_expiration(&self, cert: &CertificateData) -> Result<i64> {
        let not_after = require_not_after(cert)?;
        Ok(self.days_until(not_after))
    }

    /// Whether the current time is strictly after `NotAfter`.
    pub fn is_expired(&self, cert: &CertificateData) -> Result<bool> {
        let not_after = require_not_after(cert)?;
        Ok(self.now() > not_after)
    }

    /// Whether the certificate has `threshold_days` or fewer days left.
    ///
    /// An expired certificate is always expiring soon.
    pub fn is_expiring_soon(&self, cert: &CertificateData, threshold_days: i64) -> Result<bool> {
        validate_threshold(threshold_days)?;
        let days = self.calculate_days_until_expiration(cert)?;
        Ok(days <= threshold_days)
    }
}

/// Rejects negative renewal thresholds.
pub fn validate_threshold(threshold_days: i64) -> Result<()> {
    if threshold_days < 0 {
        return Err(CertError::InvalidThreshold(threshold_days));
    }
    Ok(())
}

fn require_not_after(cert: &CertificateData) -> Result<DateTime<Utc>> {
    let not_after = cert.not_after();
    if not_after.timestamp() == 0 {
        return Err(CertError::MissingExpiration {
            name: cert.subject().to_string(),
        });
    }
    Ok(not_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509::testutil::TestCa;
    use chrono::Duration;

    fn cert_expiring_in(offset: time::Duration) -> CertificateData {
        let ca = TestCa::new("Fleet CA");
        let (pem, _) = ca.issue_expiring_in("device-1", offset);
        CertificateData::from_pem(pem.as_bytes()).unwrap()
    }

    fn fixed_monitor(at: DateTime<Utc>) -> ExpirationMonitor {
        ExpirationMonitor::with_clock(Arc::new(move || at))
    }

    #[test]
    fn test_days_truncate_toward_zero() {
        let now = Utc::now();
        let monitor = fixed_monitor(now);
        assert_eq!(monitor.days_until(now + Duration::hours(23) + Duration::minutes(59)), 0);
        assert_eq!(monitor.days_until(now + Duration::hours(24) + Duration::minutes(1)), 1);
        assert_eq!(monitor.days_until(now - Duration::hours(23)), 0);
        assert_eq!(monitor.days_until(now - Duration::days(10) - Duration::minutes(5)), -10);
    }

    #[test]
    fn test_calculate_days_for_certificate() {
        let cert = cert_expiring_in(time::Duration::days(25));
        let days = ExpirationMonitor::new()
            .calculate_days_until_expiration(&cert)
            .unwrap();
        assert!((24..=25).contains(&days), "days = {}", days);
    }

    #[test]
    fn test_expired_is_strict() {
        let cert = cert_expiring_in(time::Duration::days(1));
        let at_expiry = fixed_monitor(cert.not_after());
        assert!(!at_expiry.is_expired(&cert).unwrap());

        let after = fixed_monitor(cert.not_after() + Duration::seconds(1));
        assert!(after.is_expired(&cert).unwrap());
    }

    #[test]
    fn test_expiring_soon_threshold() {
        let cert = cert_expiring_in(time::Duration::days(25));
        let monitor = ExpirationMonitor::new();
        assert!(monitor.is_expiring_soon(&cert, 30).unwrap());
        assert!(!monitor.is_expiring_soon(&cert, 10).unwrap());
    }

    #[test]
    fn test_expired_always_expiring_soon() {
        let cert = cert_expiring_in(-time::Duration::days(3));
        let monitor = ExpirationMonitor::new();
        assert!(monitor.is_expired(&cert).unwrap());
        assert!(monitor.is_expiring_soon(&cert, 0).unwrap());
    }

    #[test]
    fn test_zero_threshold_boundary() {
        let now = Utc::now();
        let cert = cert_expiring_in(time::Duration::hours(12));
        let monitor = fixed_monitor(now);
        assert_eq!(monitor.calculate_days_until_expiration(&cert).unwrap(), 0);
        assert!(monitor.is_expiring_soon(&cert, 0).unwrap());
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let cert = cert_expiring_in(time::Duration::days(25));
        let err = ExpirationMonitor::new()
            .is_expiring_soon(&cert, -1)
            .unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }
}
