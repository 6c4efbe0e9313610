//! Exponential backoff shared by recovery retries and CSR polling.
//!
//! Attempts are numbered from 1. The first attempt runs immediately; after a
//! failed attempt `k` the caller waits `initial * multiplier^(k-1)`, capped at
//! `max_delay`. There is no wait after the last attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CertError, Result};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Total attempts including the first.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::recovery()
    }
}

impl BackoffPolicy {
    /// Expired-certificate recovery: 3 attempts, waits of 1m then 2m.
    pub fn recovery() -> Self {
        Self {
            initial_delay_ms: 60_000,
            multiplier: 2.0,
            max_delay_ms: 3_600_000,
            max_attempts: 3,
        }
    }

    /// CSR polling: 30 attempts, waits from 10s doubling up to 5m.
    pub fn csr_poll() -> Self {
        Self {
            initial_delay_ms: 10_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            max_attempts: 30,
        }
    }

    /// Delay after the first failed attempt.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Upper bound on a single delay.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Wait after failed attempt `attempt`, or `None` when it was the last one.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let base_ms = self.initial_delay_ms as f64;
        let computed = base_ms * self.multiplier.powi(attempt as i32 - 1);
        let capped = computed.min(self.max_delay_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Checks the policy can make progress.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CertError::Config {
                reason: format!("{}: max_attempts must be at least 1", name),
            });
        }
        if self.multiplier < 1.0 {
            return Err(CertError::Config {
                reason: format!("{}: multiplier must be >= 1.0, got {}", name, self.multiplier),
            });
        }
        Ok(())
    }

    /// Runs `operation` until it succeeds or attempts run out.
    ///
    /// The closure receives the 1-based attempt number. Cancellation aborts
    /// the wait between attempts and is never retried.
    pub async fn retry<F, Fut, T>(&self, token: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if token.is_cancelled() {
                return Err(CertError::Cancelled);
            }
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if matches!(err.root(), CertError::Cancelled) {
                return Err(err);
            }
            match self.delay_after(attempt) {
                Some(delay) => {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "attempt failed, backing off");
                    sleep(token, delay).await?;
                }
                None => return Err(err),
            }
        }
    }
}

/// Sleeps for `delay` unless `token` is cancelled first.
pub async fn sleep(token: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(CertError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
