//! Prometheus metrics for certificate lifecycle operations.

use std::fmt;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{CertError, Result};

/// Result label for counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed.
    Success,
    /// The operation failed.
    Failure,
    /// The operation was submitted and awaits approval.
    Pending,
}

impl Outcome {
    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Pending => "pending",
        }
    }

    /// `Success` or `Failure` from a result.
    pub fn of<T>(result: &Result<T>) -> Self {
        if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Lifecycle metrics registered in a private registry.
#[derive(Clone)]
pub struct CertificateMetrics {
    registry: Registry,
    days_until_expiration: IntGaugeVec,
    renewals: IntCounterVec,
    recoveries: IntCounterVec,
    provisions: IntCounterVec,
    operation_duration: HistogramVec,
}

impl fmt::Debug for CertificateMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMetrics").finish_non_exhaustive()
    }
}

impl CertificateMetrics {
    /// Creates and registers every metric.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let days_until_expiration = IntGaugeVec::new(
            Opts::new(
                "edgecert_certificate_days_until_expiration",
                "Whole days until the certificate expires, negative once expired",
            ),
            &["provider", "certificate"],
        )?;
        let renewals = IntCounterVec::new(
            Opts::new("edgecert_renewals_total", "Certificate renewals by outcome"),
            &["outcome"],
        )?;
        let recoveries = IntCounterVec::new(
            Opts::new("edgecert_recoveries_total", "Expired certificate recoveries by outcome"),
            &["outcome"],
        )?;
        let provisions = IntCounterVec::new(
            Opts::new("edgecert_provisions_total", "Initial certificate provisions by outcome"),
            &["outcome"],
        )?;
        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "edgecert_operation_duration_seconds",
                "Duration of lifecycle operations",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["operation"],
        )?;

        registry.register(Box::new(days_until_expiration.clone()))?;
        registry.register(Box::new(renewals.clone()))?;
        registry.register(Box::new(recoveries.clone()))?;
        registry.register(Box::new(provisions.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            registry,
            days_until_expiration,
            renewals,
            recoveries,
            provisions,
            operation_duration,
        })
    }

    /// Sets the days-until-expiration gauge for one certificate.
    pub fn set_days_until_expiration(&self, provider: &str, certificate: &str, days: i64) {
        self.days_until_expiration
            .with_label_values(&[provider, certificate])
            .set(days);
    }

    /// Current gauge value, if the certificate has been reported.
    pub fn days_until_expiration(&self, provider: &str, certificate: &str) -> Option<i64> {
        let families = self.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "edgecert_certificate_days_until_expiration")?;
        family
            .get_metric()
            .iter()
            .find(|m| {
                let labels = m.get_label();
                labels.iter().any(|l| l.get_name() == "provider" && l.get_value() == provider)
                    && labels
                        .iter()
                        .any(|l| l.get_name() == "certificate" && l.get_value() == certificate)
            })
            .map(|m| m.get_gauge().get_value() as i64)
    }

    /// Drops the gauge series of a removed certificate.
    pub fn remove_certificate(&self, provider: &str, certificate: &str) {
        let _ = self
            .days_until_expiration
            .remove_label_values(&[provider, certificate]);
    }

    /// Counts a renewal.
    pub fn record_renewal(&self, outcome: Outcome) {
        self.renewals.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Counts a recovery.
    pub fn record_recovery(&self, outcome: Outcome) {
        self.recoveries.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Counts an initial provision.
    pub fn record_provision(&self, outcome: Outcome) {
        self.provisions.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Renewals counted with `outcome`.
    pub fn renewals(&self, outcome: Outcome) -> u64 {
        self.renewals.with_label_values(&[outcome.as_str()]).get()
    }

    /// Recoveries counted with `outcome`.
    pub fn recoveries(&self, outcome: Outcome) -> u64 {
        self.recoveries.with_label_values(&[outcome.as_str()]).get()
    }

    /// Provisions counted with `outcome`.
    pub fn provisions(&self, outcome: Outcome) -> u64 {
        self.provisions.with_label_values(&[outcome.as_str()]).get()
    }

    /// Records how long `operation` took.
    pub fn observe_operation(&self, operation: &str, duration: Duration) {
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| CertError::Parse {
            what: "metrics exposition",
            reason: e.to_string(),
        })
    }
}
