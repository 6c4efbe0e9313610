//! Lifecycle state transitions, renewal checks and expired-certificate recovery.

use std::fmt;
use std::sync::Arc;

use edgecert_api::{
    ApiError, CertificateSigningRequest, ClientCredential, ClientFactory, ManagementClient,
    RenewalReason,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::state::{CertificateLifecycleState, CertificateState};
use super::store::LifecycleStateStore;
use crate::backoff::{sleep, BackoffPolicy};
use crate::bootstrap::CredentialSource;
use crate::certificate::{certificate_key, Certificate};
use crate::config::DEFAULT_SIGNER_NAME;
use crate::error::{CertError, Result};
use crate::expiration::{validate_threshold, ExpirationMonitor};
use crate::identity::IdentityProvider;
use crate::logging::OperationTimer;
use crate::metrics::{CertificateMetrics, Outcome};
use crate::provisioner::csr::{issued_certificate, terminal_condition};
use crate::provisioner::IssuedCertificate;
use crate::registry::FactoryRegistry;
use crate::storage::StorageProvider;
use crate::tpm::TpmRenewalProvider;
use crate::validator::{CertificateValidator, ValidationTarget};
use crate::x509::CertificateData;

/// How a recovery request authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAuthMethod {
    /// Bootstrap certificate over mTLS.
    Bootstrap,
    /// TPM attestation embedded in the request.
    Tpm,
}

/// Result of [`LifecycleManager::check_renewal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalCheck {
    /// Whether the certificate is expired or inside the renewal window.
    pub needs_renewal: bool,
    /// Whole days until expiry; negative once expired.
    pub days_until_expiration: i64,
}

/// Result of [`LifecycleManager::detect_expired_certificate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryCheck {
    /// Whether `NotAfter` has passed.
    pub expired: bool,
    /// Whole days until expiry; negative once expired.
    pub days_until_expiration: i64,
}

/// Summary of one expiration sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Certificates whose expiry was read.
    pub checked: usize,
    /// Keys found expired.
    pub expired: Vec<String>,
    /// Keys recovered during the sweep.
    pub recovered: Vec<String>,
    /// Expired keys whose provisioner issues locally. These are handed back
    /// to the provisioning queue instead of the signing service.
    pub reprovision: Vec<String>,
    /// Keys whose check or recovery failed, with the error.
    pub failed: Vec<(String, String)>,
}

struct RecoveryRequest {
    request_pem: String,
    key_pem: Zeroizing<Vec<u8>>,
    attestation: Option<serde_json::Value>,
}

/// Owns lifecycle state and drives renewal checks and recovery.
pub struct LifecycleManager {
    store: Arc<LifecycleStateStore>,
    registry: Arc<FactoryRegistry>,
    validator: Arc<CertificateValidator>,
    identity: Arc<dyn IdentityProvider>,
    client_factory: Arc<dyn ClientFactory>,
    credentials: Option<Arc<dyn CredentialSource>>,
    tpm: Option<TpmRenewalProvider>,
    monitor: ExpirationMonitor,
    signer_name: String,
    recovery_retry: BackoffPolicy,
    csr_poll: BackoffPolicy,
    metrics: Option<Arc<CertificateMetrics>>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("certificates", &self.store.len())
            .field("has_credentials", &self.credentials.is_some())
            .field("has_tpm", &self.tpm.is_some())
            .field("signer_name", &self.signer_name)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Creates a manager with default backoff policies and no fallback credentials.
    pub fn new(
        store: Arc<LifecycleStateStore>,
        registry: Arc<FactoryRegistry>,
        validator: Arc<CertificateValidator>,
        identity: Arc<dyn IdentityProvider>,
        client_factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            store,
            registry,
            validator,
            identity,
            client_factory,
            credentials: None,
            tpm: None,
            monitor: ExpirationMonitor::new(),
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            recovery_retry: BackoffPolicy::recovery(),
            csr_poll: BackoffPolicy::csr_poll(),
            metrics: None,
        }
    }

    /// Source of the bootstrap credential used for recovery.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// TPM attestation provider used when no bootstrap credential is usable.
    pub fn with_tpm(mut self, tpm: TpmRenewalProvider) -> Self {
        self.tpm = Some(tpm);
        self
    }

    /// Clock used for expiry checks.
    pub fn with_monitor(mut self, monitor: ExpirationMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Signer named in recovery requests.
    pub fn with_signer_name(mut self, signer_name: impl Into<String>) -> Self {
        self.signer_name = signer_name.into();
        self
    }

    /// Retry policy around whole recovery attempts.
    pub fn with_recovery_retry(mut self, policy: BackoffPolicy) -> Self {
        self.recovery_retry = policy;
        self
    }

    /// Poll policy while waiting for a recovery certificate.
    pub fn with_csr_poll(mut self, policy: BackoffPolicy) -> Self {
        self.csr_poll = policy;
        self
    }

    /// Metrics sink.
    pub fn with_metrics(mut self, metrics: Option<Arc<CertificateMetrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// State store.
    pub fn store(&self) -> &Arc<LifecycleStateStore> {
        &self.store
    }

    /// Expiration monitor.
    pub fn monitor(&self) -> &ExpirationMonitor {
        &self.monitor
    }

    /// Current record for a certificate.
    pub fn get_state(&self, provider: &str, name: &str) -> CertificateLifecycleState {
        self.store.get(&certificate_key(provider, name))
    }

    /// Moves a certificate to `state`. Re-setting the current state changes nothing.
    pub fn set_certificate_state(&self, provider: &str, name: &str, state: CertificateState) {
        let now = self.monitor.now();
        self.store.update(&certificate_key(provider, name), |record| {
            if record.state == state {
                return;
            }
            if !record.state.is_transition_allowed(state) {
                warn!(
                    provider,
                    certificate = name,
                    from = %record.state,
                    to = %state,
                    "unexpected certificate state transition"
                );
            }
            debug!(provider, certificate = name, from = %record.state, to = %state, "certificate state changed");
            record.state = state;
            record.last_checked = Some(now);
            if state == CertificateState::Normal {
                record.last_error = None;
            }
        });
    }

    /// Parses `state` and applies it. An unknown name leaves the record untouched.
    pub fn set_certificate_state_str(&self, provider: &str, name: &str, state: &str) -> Result<()> {
        let state = state.parse::<CertificateState>()?;
        self.set_certificate_state(provider, name, state);
        Ok(())
    }

    /// Stores `error` as the last error. A renewal in progress becomes `renewal_failed`.
    pub fn record_error(&self, provider: &str, name: &str, error: &CertError) {
        let now = self.monitor.now();
        self.store.update(&certificate_key(provider, name), |record| {
            record.last_error = Some(error.to_string());
            record.last_checked = Some(now);
            if record.state == CertificateState::Renewing {
                record.state = CertificateState::RenewalFailed;
            }
        });
        warn!(provider, certificate = name, error = %error, "certificate operation failed");
    }

    fn record_expiry(&self, cert: &Certificate, days: i64, not_after: chrono::DateTime<chrono::Utc>) {
        let now = self.monitor.now();
        self.store.update(&cert.key(), |record| {
            record.days_until_expiration = days;
            record.expiration_time = Some(not_after);
            record.last_checked = Some(now);
        });
        if let Some(metrics) = &self.metrics {
            metrics.set_days_until_expiration(cert.provider(), cert.name(), days);
        }
    }

    /// Records `installed` as the active certificate and returns to `normal`.
    pub fn record_installed(&self, cert: &Certificate, installed: &CertificateData) -> Result<i64> {
        let days = self.monitor.calculate_days_until_expiration(installed)?;
        cert.set_info_from(installed);
        self.record_expiry(cert, days, installed.not_after());
        self.set_certificate_state(cert.provider(), cert.name(), CertificateState::Normal);
        Ok(days)
    }

    fn storage_for(&self, cert: &Certificate) -> Result<Arc<dyn StorageProvider>> {
        match cert.storage() {
            Some(storage) => Ok(storage),
            None => self.registry.build_storage(&cert.config()),
        }
    }

    /// Reads the stored certificate and decides whether it needs renewal.
    ///
    /// Expired certificates report `needs_renewal` with negative days so the
    /// caller can route them to recovery. A renewal or recovery in progress
    /// keeps its state; only the day count is refreshed.
    pub async fn check_renewal(&self, cert: &Certificate, threshold_days: i64) -> Result<RenewalCheck> {
        validate_threshold(threshold_days)?;
        let storage = self.storage_for(cert)?;
        let active = storage.load_certificate().await?;
        let days = self.monitor.calculate_days_until_expiration(&active)?;
        let expired = self.monitor.is_expired(&active)?;
        let expiring = self.monitor.is_expiring_soon(&active, threshold_days)?;

        cert.set_info_from(&active);
        self.record_expiry(cert, days, active.not_after());

        let needs_renewal = expired || expiring;
        let current = self.get_state(cert.provider(), cert.name()).state;
        if !current.is_in_progress() {
            let next = if expired {
                CertificateState::Expired
            } else if expiring {
                CertificateState::ExpiringSoon
            } else {
                CertificateState::Normal
            };
            self.set_certificate_state(cert.provider(), cert.name(), next);
        }
        Ok(RenewalCheck {
            needs_renewal,
            days_until_expiration: days,
        })
    }

    /// Reads the stored certificate and reports whether it has expired.
    pub async fn detect_expired_certificate(&self, cert: &Certificate) -> Result<ExpiryCheck> {
        let storage = self.storage_for(cert)?;
        let active = storage.load_certificate().await?;
        let days = self.monitor.calculate_days_until_expiration(&active)?;
        let expired = self.monitor.is_expired(&active)?;
        cert.set_info_from(&active);
        self.record_expiry(cert, days, active.not_after());
        Ok(ExpiryCheck {
            expired,
            days_until_expiration: days,
        })
    }

    /// Checks every certificate and starts recovery for expired ones.
    ///
    /// Locally issued certificates are only marked `recovering` and listed
    /// in [`SweepReport::reprovision`]. Certificates that were never
    /// provisioned, or whose operation lock is held, are skipped. A failure
    /// on one certificate does not stop the sweep.
    pub async fn check_expired_certificates(
        &self,
        token: &CancellationToken,
        certs: &[Arc<Certificate>],
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for cert in certs {
            if token.is_cancelled() {
                return Err(CertError::Cancelled);
            }
            if cert.info().is_none() {
                continue;
            }
            if cert.op_lock().try_lock().is_err() {
                debug!(certificate = %cert.key(), "operation in progress, skipping expiry check");
                continue;
            }

            let check = match self.detect_expired_certificate(cert).await {
                Ok(check) => check,
                Err(e) => {
                    warn!(certificate = %cert.key(), error = %e, "expiry check failed");
                    report.failed.push((cert.key(), e.to_string()));
                    continue;
                }
            };
            report.checked += 1;
            if !check.expired {
                continue;
            }

            report.expired.push(cert.key());
            let current = self.get_state(cert.provider(), cert.name()).state;
            if current != CertificateState::Recovering {
                info!(
                    provider = cert.provider(),
                    certificate = cert.name(),
                    days_until_expiration = check.days_until_expiration,
                    "certificate expired"
                );
                self.set_certificate_state(cert.provider(), cert.name(), CertificateState::Expired);
            }

            if cert.is_self_signed() {
                self.set_certificate_state(cert.provider(), cert.name(), CertificateState::Recovering);
                report.reprovision.push(cert.key());
                continue;
            }

            match self.trigger_recovery(token, cert).await {
                Ok(()) => report.recovered.push(cert.key()),
                Err(e) if matches!(e.root(), CertError::Cancelled) => return Err(e),
                Err(e) => report.failed.push((cert.key(), e.to_string())),
            }
        }
        Ok(report)
    }

    /// Runs recovery with retries, holding the certificate's operation lock.
    ///
    /// The state stays `recovering` when every attempt fails; the next sweep
    /// starts over.
    pub async fn trigger_recovery(&self, token: &CancellationToken, cert: &Certificate) -> Result<()> {
        let _guard = tokio::select! {
            guard = cert.op_lock().lock() => guard,
            _ = token.cancelled() => return Err(CertError::Cancelled),
        };
        self.set_certificate_state(cert.provider(), cert.name(), CertificateState::Recovering);
        let storage = self.storage_for(cert).map_err(|e| {
            self.record_error(cert.provider(), cert.name(), &e);
            e
        })?;
        cert.set_storage(storage);

        let this = self;
        let result = self
            .recovery_retry
            .retry(token, move |attempt| {
                debug!(certificate = %cert.key(), attempt, "recovery attempt");
                this.recover_expired_certificate(token, cert)
            })
            .await;
        cert.reset_handles();

        if let Some(metrics) = &self.metrics {
            metrics.record_recovery(Outcome::of(&result));
        }
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_error(cert.provider(), cert.name(), &e);
                Err(e.context(format!(
                    "recovery of {} failed after {} attempts",
                    cert.key(),
                    self.recovery_retry.max_attempts
                )))
            }
        }
    }

    fn step_failed(&self, cert: &Certificate, step: &str, error: CertError) -> CertError {
        self.record_error(cert.provider(), cert.name(), &error);
        error.context(format!("recovery step {} failed", step))
    }

    fn timer(&self, step: &'static str, cert: &Certificate) -> OperationTimer {
        OperationTimer::start(step, cert.provider(), cert.name()).with_metrics(self.metrics.clone())
    }

    /// One recovery attempt: choose auth, build and submit a request, poll,
    /// install the certificate, and return to `normal`.
    pub async fn recover_expired_certificate(&self, token: &CancellationToken, cert: &Certificate) -> Result<()> {
        self.set_certificate_state(cert.provider(), cert.name(), CertificateState::Recovering);

        let method = self
            .timer("determine_auth_method", cert)
            .finish(self.determine_recovery_auth_method().await)
            .map_err(|e| self.step_failed(cert, "determine_auth_method", e))?;
        info!(provider = cert.provider(), certificate = cert.name(), method = ?method, "recovering expired certificate");

        let common_name = cert.expected_common_name(self.identity.device_name());
        let request = self
            .timer("generate_csr", cert)
            .finish(self.generate_recovery_csr(method, &common_name))
            .map_err(|e| self.step_failed(cert, "generate_csr", e))?;

        let (client, created) = self
            .timer("submit_csr", cert)
            .finish(self.submit_recovery_csr(method, cert, &request).await)
            .map_err(|e| self.step_failed(cert, "submit_csr", e))?;

        let issued = self
            .timer("poll_csr", cert)
            .finish(self.poll_for_certificate(token, client.as_ref(), created, &request.key_pem).await)
            .map_err(|e| self.step_failed(cert, "poll_csr", e))?;

        let storage = self
            .storage_for(cert)
            .map_err(|e| self.step_failed(cert, "install_certificate", e))?;
        let target = ValidationTarget {
            provider: cert.provider(),
            certificate: cert.name(),
            common_name: &common_name,
            self_signed: false,
        };
        self.timer("install_certificate", cert)
            .finish(self.validator.install_pending(&target, storage.as_ref(), &issued).await)
            .map_err(|e| self.step_failed(cert, "install_certificate", e))?;

        cert.reset_handles();
        let days = self
            .record_installed(cert, &issued.cert)
            .map_err(|e| self.step_failed(cert, "record_success", e))?;
        info!(
            provider = cert.provider(),
            certificate = cert.name(),
            days_until_expiration = days,
            "certificate recovered"
        );
        Ok(())
    }

    /// Bootstrap when a valid bootstrap certificate exists, else TPM when configured.
    pub async fn determine_recovery_auth_method(&self) -> Result<RecoveryAuthMethod> {
        if let Some(credentials) = &self.credentials {
            if credentials.has_valid_credential().await {
                return Ok(RecoveryAuthMethod::Bootstrap);
            }
        }
        if self.tpm.is_some() {
            return Ok(RecoveryAuthMethod::Tpm);
        }
        Err(CertError::NoAuthMethod)
    }

    fn generate_recovery_csr(&self, method: RecoveryAuthMethod, common_name: &str) -> Result<RecoveryRequest> {
        match method {
            RecoveryAuthMethod::Bootstrap => Ok(RecoveryRequest {
                request_pem: self.identity.create_csr(common_name)?,
                key_pem: self.identity.key_pem()?,
                attestation: None,
            }),
            RecoveryAuthMethod::Tpm => {
                let tpm = self.tpm.as_ref().ok_or(CertError::NoAuthMethod)?;
                let attestation = tpm.generate_renewal_attestation()?;
                let request_pem = tpm.generate_tpm_csr(common_name, &attestation)?;
                Ok(RecoveryRequest {
                    request_pem,
                    key_pem: tpm.device_key_pem()?,
                    attestation: Some(attestation.to_json()?),
                })
            }
        }
    }

    async fn submit_recovery_csr(
        &self,
        method: RecoveryAuthMethod,
        cert: &Certificate,
        request: &RecoveryRequest,
    ) -> Result<(Arc<dyn ManagementClient>, CertificateSigningRequest)> {
        let credential: Option<ClientCredential> = match method {
            RecoveryAuthMethod::Bootstrap => {
                let credentials = self.credentials.as_ref().ok_or(CertError::NoAuthMethod)?;
                Some(credentials.credential_for_auth().await?.tls.to_client_credential())
            }
            RecoveryAuthMethod::Tpm => None,
        };
        let client = self.client_factory.client(credential.as_ref())?;

        let name = format!("{}-recovery-{}", cert.name(), hex::encode(rand::random::<[u8; 4]>()));
        let mut csr = CertificateSigningRequest::new(&name, request.request_pem.clone(), &self.signer_name)
            .with_renewal_reason(RenewalReason::Expired);
        csr.spec.attestation = request.attestation.clone();

        let response = client.create_certificate_signing_request(&csr).await?;
        if !response.is_created_or_ok() {
            return Err(ApiError::UnexpectedStatus {
                status: response.status,
                message: format!("creating recovery request {}", name),
            }
            .into());
        }
        info!(request = %name, certificate = cert.name(), "submitted recovery request");
        Ok((client, response.body.unwrap_or(csr)))
    }

    /// Waits for `created` to be issued. `Denied` and `Failed` end the wait at once.
    async fn poll_for_certificate(
        &self,
        token: &CancellationToken,
        client: &dyn ManagementClient,
        created: CertificateSigningRequest,
        key_pem: &[u8],
    ) -> Result<IssuedCertificate> {
        if let Some(issued) = issued_certificate(&created, key_pem)? {
            return Ok(issued);
        }
        terminal_condition(&created)?;

        let name = created.name;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if token.is_cancelled() {
                return Err(CertError::Cancelled);
            }
            match client.get_certificate_signing_request(&name).await {
                Ok(response) => match (response.is_created_or_ok(), response.body) {
                    (true, Some(csr)) => {
                        if let Some(issued) = issued_certificate(&csr, key_pem)? {
                            return Ok(issued);
                        }
                        terminal_condition(&csr)?;
                        debug!(request = %name, attempt, "recovery request still pending");
                    }
                    (_, _) => warn!(request = %name, status = response.status, "unexpected poll response"),
                },
                Err(e) if e.is_transient() => {
                    warn!(request = %name, attempt, error = %e, "poll failed");
                }
                Err(e) => return Err(e.into()),
            }

            match self.csr_poll.delay_after(attempt) {
                Some(delay) => sleep(token, delay).await?,
                None => {
                    return Err(CertError::PollTimeout {
                        name,
                        attempts: attempt,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CertKeyPaths, CertificateConfig};
    use crate::identity::FileIdentityProvider;
    use crate::x509::testutil::TestCa;
    use edgecert_api::ApiResult;
    use tempfile::TempDir;

    struct NoClients;

    impl ClientFactory for NoClients {
        fn client(&self, _credential: Option<&ClientCredential>) -> ApiResult<Arc<dyn ManagementClient>> {
            Err(ApiError::Transport {
                reason: "offline".to_string(),
            })
        }
    }

    struct Fixture {
        dir: TempDir,
        ca: TestCa,
        manager: LifecycleManager,
        cert: Arc<Certificate>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let ca = TestCa::new("Fleet CA");
        let bundle = dir.path().join("ca.crt");
        std::fs::write(&bundle, ca.pem()).unwrap();
        let identity = Arc::new(
            FileIdentityProvider::load_or_create(&dir.path().join("device.key"))
                .await
                .unwrap(),
        );
        let validator = Arc::new(CertificateValidator::new(&bundle, identity.device_name()));
        let manager = LifecycleManager::new(
            Arc::new(LifecycleStateStore::new()),
            Arc::new(FactoryRegistry::with_defaults().unwrap()),
            validator,
            identity,
            Arc::new(NoClients),
        )
        .with_recovery_retry(BackoffPolicy {
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 10,
            max_attempts: 2,
        });
        let paths = CertKeyPaths {
            cert_path: dir.path().join("mgmt.crt"),
            key_path: dir.path().join("mgmt.key"),
        };
        let config = CertificateConfig {
            name: "management".to_string(),
            provisioner: crate::config::TypedConfig::new("csr", serde_json::json!({})),
            storage: CertificateConfig::filesystem_storage(&paths),
        };
        Fixture {
            dir,
            ca,
            manager,
            cert: Arc::new(Certificate::new("static", config)),
        }
    }

    fn install(f: &Fixture, start: i64, end: i64) -> CertificateData {
        let (pem, key) = f.ca.issue("device", start, end);
        std::fs::write(f.dir.path().join("mgmt.crt"), &pem).unwrap();
        std::fs::write(f.dir.path().join("mgmt.key"), key).unwrap();
        CertificateData::from_pem(pem.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_check_renewal_expiring_soon() {
        let f = fixture().await;
        install(&f, -300, 25);
        let check = f.manager.check_renewal(&f.cert, 30).await.unwrap();
        assert!(check.needs_renewal);
        assert!((24..=25).contains(&check.days_until_expiration));
        let state = f.manager.get_state("static", "management");
        assert_eq!(state.state, CertificateState::ExpiringSoon);
        assert_eq!(state.days_until_expiration, check.days_until_expiration);
        assert!(f.cert.info().is_some());
    }

    #[tokio::test]
    async fn test_check_renewal_normal_and_expired() {
        let f = fixture().await;
        install(&f, -1, 200);
        let check = f.manager.check_renewal(&f.cert, 30).await.unwrap();
        assert!(!check.needs_renewal);
        assert_eq!(f.manager.get_state("static", "management").state, CertificateState::Normal);

        install(&f, -40, -10);
        let check = f.manager.check_renewal(&f.cert, 30).await.unwrap();
        assert!(check.needs_renewal);
        assert!(check.days_until_expiration <= -9);
        assert_eq!(f.manager.get_state("static", "management").state, CertificateState::Expired);
    }

    #[tokio::test]
    async fn test_negative_threshold_changes_nothing() {
        let f = fixture().await;
        install(&f, -300, 25);
        f.manager.set_certificate_state("static", "management", CertificateState::Normal);
        let before = f.manager.get_state("static", "management");
        let err = f.manager.check_renewal(&f.cert, -1).await.unwrap_err();
        assert!(err.to_string().contains("non-negative"));
        assert_eq!(f.manager.get_state("static", "management"), before);
    }

    #[tokio::test]
    async fn test_check_renewal_keeps_in_progress_state() {
        let f = fixture().await;
        install(&f, -300, 5);
        f.manager.set_certificate_state("static", "management", CertificateState::Renewing);
        f.manager.check_renewal(&f.cert, 30).await.unwrap();
        assert_eq!(f.manager.get_state("static", "management").state, CertificateState::Renewing);
    }

    #[test]
    fn test_record_error_flips_renewing_only() {
        let store = LifecycleStateStore::new();
        store.update("p/a", |s| s.state = CertificateState::Renewing);
        store.update("p/b", |s| s.state = CertificateState::Recovering);
        let manager = LifecycleManager {
            store: Arc::new(store),
            registry: Arc::new(FactoryRegistry::new()),
            validator: Arc::new(CertificateValidator::new("/nonexistent", "d")),
            identity: Arc::new(
                FileIdentityProvider::from_pem(Zeroizing::new(
                    rcgen::KeyPair::generate().unwrap().serialize_pem(),
                ))
                .unwrap(),
            ),
            client_factory: Arc::new(NoClients),
            credentials: None,
            tpm: None,
            monitor: ExpirationMonitor::new(),
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            recovery_retry: BackoffPolicy::recovery(),
            csr_poll: BackoffPolicy::csr_poll(),
            metrics: None,
        };
        manager.record_error("p", "a", &CertError::NoAuthMethod);
        manager.record_error("p", "b", &CertError::NoAuthMethod);
        let a = manager.get_state("p", "a");
        assert_eq!(a.state, CertificateState::RenewalFailed);
        assert_eq!(a.last_error.as_deref(), Some("no authentication method available for recovery"));
        assert_eq!(manager.get_state("p", "b").state, CertificateState::Recovering);
    }

    #[tokio::test]
    async fn test_set_state_idempotent_and_invalid_rejected() {
        let f = fixture().await;
        f.manager.set_certificate_state("static", "management", CertificateState::Expired);
        let first = f.manager.get_state("static", "management");
        f.manager.set_certificate_state("static", "management", CertificateState::Expired);
        assert_eq!(f.manager.get_state("static", "management"), first);

        let err = f
            .manager
            .set_certificate_state_str("static", "management", "broken")
            .unwrap_err();
        assert!(matches!(err, CertError::InvalidState(_)));
        assert_eq!(f.manager.get_state("static", "management"), first);
    }

    #[tokio::test]
    async fn test_concurrent_state_writers_leave_attempted_state() {
        let f = fixture().await;
        let attempted = [
            CertificateState::Normal,
            CertificateState::ExpiringSoon,
            CertificateState::Expired,
            CertificateState::Recovering,
        ];
        let error = CertError::Provision {
            reason: "signing service unreachable".to_string(),
        };

        std::thread::scope(|scope| {
            for worker in 0..8usize {
                let manager = &f.manager;
                let error = &error;
                scope.spawn(move || {
                    for i in 0..250usize {
                        if (worker + i) % 3 == 0 {
                            manager.record_error("static", "management", error);
                        } else {
                            let state = attempted[(worker + i) % attempted.len()];
                            manager.set_certificate_state("static", "management", state);
                        }
                    }
                });
            }
        });

        let last = f.manager.get_state("static", "management");
        assert!(CertificateState::is_valid_state(last.state.as_str()));
        assert!(attempted.contains(&last.state));
        assert_eq!(f.manager.store().len(), 1);
    }

    #[tokio::test]
    async fn test_no_auth_method() {
        let f = fixture().await;
        assert!(matches!(
            f.manager.determine_recovery_auth_method().await,
            Err(CertError::NoAuthMethod)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_without_auth_stays_recovering() {
        let f = fixture().await;
        install(&f, -40, -10);
        let token = CancellationToken::new();
        let report = f
            .manager
            .check_expired_certificates(&token, &[f.cert.clone()])
            .await
            .unwrap_or_default();
        // info is only populated once the certificate has been read
        assert_eq!(report.checked, 0);

        f.manager.detect_expired_certificate(&f.cert).await.unwrap();
        let report = f
            .manager
            .check_expired_certificates(&token, &[f.cert.clone()])
            .await
            .unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.expired, vec!["static/management".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("failed after 2 attempts"));
        assert!(report.failed[0].1.contains("no authentication method"));

        let state = f.manager.get_state("static", "management");
        assert_eq!(state.state, CertificateState::Recovering);
        assert!(state.last_error.is_some());
        assert!(!f.cert.has_handles());
    }

    #[tokio::test]
    async fn test_expired_self_signed_left_for_reprovisioning() {
        let f = fixture().await;
        install(&f, -40, -10);
        let mut config = f.cert.config();
        config.provisioner = crate::config::TypedConfig::new(
            "self-signed",
            serde_json::json!({ "common_name": "device" }),
        );
        let cert = Arc::new(Certificate::new("static", config));
        f.manager.detect_expired_certificate(&cert).await.unwrap();

        let report = f
            .manager
            .check_expired_certificates(&CancellationToken::new(), &[cert.clone()])
            .await
            .unwrap();

        assert_eq!(report.expired, vec!["static/management".to_string()]);
        assert_eq!(report.reprovision, vec!["static/management".to_string()]);
        assert!(report.recovered.is_empty());
        assert!(report.failed.is_empty());
        let state = f.manager.get_state("static", "management");
        assert_eq!(state.state, CertificateState::Recovering);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_trigger_recovery_cancelled() {
        let f = fixture().await;
        let token = CancellationToken::new();
        token.cancel();
        let _held = f.cert.op_lock().lock().await;
        assert!(matches!(
            f.manager.trigger_recovery(&token, &f.cert).await,
            Err(CertError::Cancelled)
        ));
    }
}
