//! Structured logging for lifecycle operations.
//!
//! Every timed stage reports through [`OperationTimer`], producing one record
//! with the operation name, duration and outcome, and feeding the duration
//! histogram when metrics are attached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{CertError, Result};
use crate::metrics::CertificateMetrics;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per record.
    Json,
}

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(format: LogFormat) -> std::result::Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .try_init()
}

/// Emits the record for one completed lifecycle stage.
pub fn log_operation(
    operation: &str,
    provider: &str,
    certificate: &str,
    duration: Duration,
    error: Option<&CertError>,
) {
    let duration_ms = duration.as_millis() as u64;
    match error {
        None => info!(
            operation,
            provider,
            certificate,
            duration_ms,
            success = true,
            "certificate operation completed"
        ),
        Some(e) => warn!(
            operation,
            provider,
            certificate,
            duration_ms,
            success = false,
            error = %e,
            "certificate operation failed"
        ),
    }
}

/// Times a stage from construction until [`OperationTimer::finish`].
#[derive(Debug)]
pub struct OperationTimer {
    operation: &'static str,
    provider: String,
    certificate: String,
    start: Instant,
    metrics: Option<Arc<CertificateMetrics>>,
}

impl OperationTimer {
    /// Starts timing `operation` for one certificate.
    pub fn start(operation: &'static str, provider: &str, certificate: &str) -> Self {
        Self {
            operation,
            provider: provider.to_string(),
            certificate: certificate.to_string(),
            start: Instant::now(),
            metrics: None,
        }
    }

    /// Also records the duration in `metrics`.
    pub fn with_metrics(mut self, metrics: Option<Arc<CertificateMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Elapsed time so far.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Logs the outcome of `result` and hands it back unchanged.
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        let elapsed = self.start.elapsed();
        log_operation(
            self.operation,
            &self.provider,
            &self.certificate,
            elapsed,
            result.as_ref().err(),
        );
        if let Some(metrics) = &self.metrics {
            metrics.observe_operation(self.operation, elapsed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_passes_result_through() {
        let timer = OperationTimer::start("load_ca_bundle", "static", "mgmt");
        let ok = timer.finish(Ok(7));
        assert_eq!(ok.unwrap(), 7);

        let timer = OperationTimer::start("load_ca_bundle", "static", "mgmt");
        let err: Result<()> = timer.finish(Err(CertError::NoAuthMethod));
        assert!(matches!(err, Err(CertError::NoAuthMethod)));
    }

    #[test]
    fn test_finish_feeds_histogram() {
        let metrics = Arc::new(CertificateMetrics::new().unwrap());
        let timer =
            OperationTimer::start("atomic_swap", "static", "mgmt").with_metrics(Some(metrics.clone()));
        let _ = timer.finish(Ok(()));
        let text = metrics.render().unwrap();
        assert!(text.contains("edgecert_operation_duration_seconds_count{operation=\"atomic_swap\"} 1"));
    }

    #[test]
    fn test_log_format_deserializes_lowercase() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }
}
