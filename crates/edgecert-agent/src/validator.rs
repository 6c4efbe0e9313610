//! Pending-certificate validation and the swap protocol around it.
//!
//! A renewed certificate is written next to the active one, validated in
//! five ordered stages, and only then promoted. Any failure removes the
//! pending files and leaves the active pair untouched.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{CertError, Result, ValidationStage};
use crate::expiration::ExpirationMonitor;
use crate::logging::OperationTimer;
use crate::metrics::CertificateMetrics;
use crate::provisioner::IssuedCertificate;
use crate::storage::{StorageProvider, SwapFailure};
use crate::tls::TlsCredential;
use crate::x509::CertificateData;

/// Remaining validity below which a freshly issued certificate is logged.
pub const SHORT_VALIDITY_WARNING_DAYS: i64 = 7;

/// Who a pending certificate belongs to and what it must look like.
#[derive(Debug, Clone, Copy)]
pub struct ValidationTarget<'a> {
    /// Configuration provider name, for logs.
    pub provider: &'a str,
    /// Certificate name, for logs.
    pub certificate: &'a str,
    /// Required subject common name.
    pub common_name: &'a str,
    /// Trust the certificate's own signature instead of the CA bundle.
    pub self_signed: bool,
}

/// What startup crash recovery found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapRecovery {
    /// No pending certificate; nothing to do.
    NoPending,
    /// Active pair was valid; stale pending files were removed.
    CleanedStalePending,
    /// Active pair was unreadable and was restored from backup.
    RestoredFromBackup,
    /// Active pair was unreadable with no backup; pending was promoted.
    PromotedPending,
    /// Active pair did not match its key and was rolled back from backup.
    RolledBack,
}

/// Validates pending certificates against the CA bundle and device identity.
#[derive(Debug, Clone)]
pub struct CertificateValidator {
    ca_bundle_path: PathBuf,
    device_name: String,
    monitor: ExpirationMonitor,
    metrics: Option<Arc<CertificateMetrics>>,
}

impl CertificateValidator {
    /// Creates a validator trusting the bundle at `ca_bundle_path`.
    pub fn new(ca_bundle_path: impl Into<PathBuf>, device_name: impl Into<String>) -> Self {
        Self {
            ca_bundle_path: ca_bundle_path.into(),
            device_name: device_name.into(),
            monitor: ExpirationMonitor::new(),
            metrics: None,
        }
    }

    /// Uses `monitor` as the verification clock.
    pub fn with_monitor(mut self, monitor: ExpirationMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Feeds stage durations into `metrics`.
    pub fn with_metrics(mut self, metrics: Option<Arc<CertificateMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Device name certificates are issued to.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Target for the device management certificate.
    pub fn management_target<'a>(&'a self, provider: &'a str, certificate: &'a str) -> ValidationTarget<'a> {
        ValidationTarget {
            provider,
            certificate,
            common_name: &self.device_name,
            self_signed: false,
        }
    }

    fn timer(&self, operation: &'static str, target: &ValidationTarget<'_>) -> OperationTimer {
        OperationTimer::start(operation, target.provider, target.certificate).with_metrics(self.metrics.clone())
    }

    /// Validates a CA-issued device certificate.
    pub async fn validate_pending_certificate(&self, cert: &CertificateData, key_pem: &[u8]) -> Result<()> {
        let target = self.management_target("agent", "pending");
        self.validate_pending(&target, cert, key_pem).await
    }

    /// Runs the five validation stages, stopping at the first failure.
    pub async fn validate_pending(
        &self,
        target: &ValidationTarget<'_>,
        cert: &CertificateData,
        key_pem: &[u8],
    ) -> Result<()> {
        let roots = self
            .timer("load_ca_bundle", target)
            .finish(self.load_roots(target, cert).await)?;

        self.timer("verify_signature", target)
            .finish(self.verify_signature(cert, &roots))?;

        self.timer("verify_identity", target)
            .finish(verify_identity(cert, target.common_name))?;

        self.timer("check_expiration", target)
            .finish(self.check_expiration(target, cert))?;

        self.timer("verify_key_pair", target)
            .finish(verify_key_pair(cert, key_pem))?;

        Ok(())
    }

    async fn load_roots(&self, target: &ValidationTarget<'_>, cert: &CertificateData) -> Result<Vec<CertificateData>> {
        if target.self_signed {
            return Ok(vec![cert.clone()]);
        }
        let pem = tokio::fs::read(&self.ca_bundle_path).await.map_err(|e| {
            CertError::validation(
                ValidationStage::CaBundle,
                format!("{}: {}", self.ca_bundle_path.display(), e),
            )
        })?;
        CertificateData::all_from_pem(&pem)
            .map_err(|e| CertError::validation(ValidationStage::CaBundle, e.to_string()))
    }

    fn verify_signature(&self, cert: &CertificateData, roots: &[CertificateData]) -> Result<()> {
        if cert.find_issuer(roots).is_none() {
            return Err(CertError::validation(
                ValidationStage::Signature,
                format!("issuer {} is not a trusted CA", cert.issuer()),
            ));
        }
        let now = self.monitor.now();
        if !cert.is_valid_at(now) {
            return Err(CertError::validation(
                ValidationStage::Signature,
                format!(
                    "certificate valid from {} to {}, not at {}",
                    cert.not_before(),
                    cert.not_after(),
                    now
                ),
            ));
        }
        Ok(())
    }

    fn check_expiration(&self, target: &ValidationTarget<'_>, cert: &CertificateData) -> Result<()> {
        let expired = self
            .monitor
            .is_expired(cert)
            .map_err(|e| CertError::validation(ValidationStage::Expiration, e.to_string()))?;
        if expired {
            return Err(CertError::validation(
                ValidationStage::Expiration,
                format!("certificate expired at {}", cert.not_after()),
            ));
        }
        let days = self
            .monitor
            .calculate_days_until_expiration(cert)
            .map_err(|e| CertError::validation(ValidationStage::Expiration, e.to_string()))?;
        if days < SHORT_VALIDITY_WARNING_DAYS {
            warn!(
                provider = target.provider,
                certificate = target.certificate,
                days_until_expiration = days,
                "pending certificate has less than {} days of validity",
                SHORT_VALIDITY_WARNING_DAYS
            );
        }
        Ok(())
    }

    /// Promotes the pending pair.
    pub async fn atomic_swap(
        &self,
        target: &ValidationTarget<'_>,
        storage: &dyn StorageProvider,
    ) -> std::result::Result<(), SwapFailure> {
        let timer = self.timer("atomic_swap", target);
        let (active_modified, result) = match storage.atomic_swap().await {
            Ok(()) => (false, Ok(())),
            Err(failure) => (failure.active_modified, Err(failure.error)),
        };
        timer
            .finish(result)
            .map_err(|error| SwapFailure { active_modified, error })?;
        info!(provider = target.provider, certificate = target.certificate, "pending certificate promoted");
        Ok(())
    }

    /// Restores the previous pair after `cause` and removes pending files.
    pub async fn rollback_swap(
        &self,
        target: &ValidationTarget<'_>,
        storage: &dyn StorageProvider,
        cause: &CertError,
    ) -> Result<()> {
        warn!(
            provider = target.provider,
            certificate = target.certificate,
            error = %cause,
            "rolling back certificate swap"
        );
        self.timer("rollback_swap", target)
            .finish(storage.rollback_swap().await)
    }

    /// Writes `issued` as pending, validates it, and swaps it in.
    ///
    /// On validation failure the pending files are removed. On swap failure
    /// the previous pair is restored only if the swap got as far as touching
    /// it. The active pair is never written directly.
    pub async fn install_pending(
        &self,
        target: &ValidationTarget<'_>,
        storage: &dyn StorageProvider,
        issued: &IssuedCertificate,
    ) -> Result<()> {
        storage.write_pending(&issued.cert, &issued.key_pem).await?;

        if let Err(e) = self.validate_pending(target, &issued.cert, &issued.key_pem).await {
            if let Err(cleanup) = storage.cleanup_pending().await {
                warn!(certificate = target.certificate, error = %cleanup, "failed to remove pending certificate");
            }
            return Err(e);
        }

        if let Err(failure) = self.atomic_swap(target, storage).await {
            if failure.active_modified {
                if let Err(rollback) = self.rollback_swap(target, storage, &failure.error).await {
                    error!(certificate = target.certificate, error = %rollback, "rollback after failed swap also failed");
                }
            } else if let Err(cleanup) = storage.cleanup_pending().await {
                warn!(certificate = target.certificate, error = %cleanup, "failed to remove pending certificate");
            }
            return Err(failure.error);
        }
        Ok(())
    }

    /// Repairs a swap interrupted by a crash. Called once per certificate at startup.
    pub async fn detect_and_recover_incomplete_swap(
        &self,
        target: &ValidationTarget<'_>,
        storage: &dyn StorageProvider,
    ) -> Result<SwapRecovery> {
        if !storage.has_pending_certificate().await? {
            return Ok(SwapRecovery::NoPending);
        }
        warn!(
            provider = target.provider,
            certificate = target.certificate,
            "found pending certificate from an incomplete swap"
        );

        let active = match storage.load_certificate().await {
            Ok(cert) => storage.load_key().await.map(|key| (cert, key)),
            Err(e) => Err(e),
        };

        let (cert, key) = match active {
            Ok(pair) => pair,
            Err(e) => {
                warn!(certificate = target.certificate, error = %e, "active certificate unreadable");
                return self.recover_unreadable_active(target, storage).await;
            }
        };

        if cert.matches_private_key(&key).unwrap_or(false) {
            storage.cleanup_pending().await?;
            info!(certificate = target.certificate, "active certificate valid, removed stale pending files");
            return Ok(SwapRecovery::CleanedStalePending);
        }

        warn!(certificate = target.certificate, "active certificate does not match its key");
        if storage.restore_backup().await? {
            storage.cleanup_pending().await?;
            return Ok(SwapRecovery::RolledBack);
        }
        storage.cleanup_pending().await?;
        Err(CertError::validation(
            ValidationStage::KeyPair,
            "active certificate does not match its key and no backup exists",
        ))
    }

    async fn recover_unreadable_active(
        &self,
        target: &ValidationTarget<'_>,
        storage: &dyn StorageProvider,
    ) -> Result<SwapRecovery> {
        if storage.restore_backup().await? {
            storage.cleanup_pending().await?;
            info!(certificate = target.certificate, "restored active certificate from backup");
            return Ok(SwapRecovery::RestoredFromBackup);
        }

        let promoted = async {
            let pending = storage.load_pending_certificate().await?;
            verify_identity(&pending, target.common_name)?;
            storage.atomic_swap().await.map_err(CertError::from)
        }
        .await;

        match promoted {
            Ok(()) => {
                warn!(certificate = target.certificate, "promoted pending certificate without a usable active pair");
                Ok(SwapRecovery::PromotedPending)
            }
            Err(e) => {
                error!(
                    provider = target.provider,
                    certificate = target.certificate,
                    error = %e,
                    "cannot recover certificate, manual intervention required"
                );
                Err(e.context(format!("recovering incomplete swap of {}", target.certificate)))
            }
        }
    }
}

fn verify_identity(cert: &CertificateData, expected: &str) -> Result<()> {
    match cert.common_name() {
        Some(cn) if cn == expected => Ok(()),
        Some(cn) => Err(CertError::validation(
            ValidationStage::Identity,
            format!("common name {} does not match {}", cn, expected),
        )),
        None => Err(CertError::validation(
            ValidationStage::Identity,
            "certificate has no common name",
        )),
    }
}

fn verify_key_pair(cert: &CertificateData, key_pem: &[u8]) -> Result<()> {
    TlsCredential::from_pem(cert.to_pem().as_bytes(), key_pem)
        .map_err(|e| CertError::validation(ValidationStage::KeyPair, e.to_string()))?;
    let matches = cert
        .matches_private_key(key_pem)
        .map_err(|e| CertError::validation(ValidationStage::KeyPair, e.to_string()))?;
    if !matches {
        return Err(CertError::validation(
            ValidationStage::KeyPair,
            "private key does not match certificate public key",
        ));
    }
    Ok(())
}
