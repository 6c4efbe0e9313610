//! Certificate manager: registry, sync, processing queue and background tasks.
//!
//! `sync` reconciles declared certificates with the registry and queues
//! provisioning or renewal work. A single worker drains the queue; two
//! tickers re-check renewal windows and sweep for expired certificates.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edgecert_api::{ClientFactory, ManagementClient};
use parking_lot::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::bootstrap::{BootstrapCertificateHandler, CredentialSource};
use crate::certificate::{certificate_key, Certificate};
use crate::config::{validate_certificate_list, AgentConfig, CertificateConfig, DEFAULT_SIGNER_NAME};
use crate::config_provider::{ConfigProvider, DropInConfigProvider, StaticConfigProvider};
use crate::error::{CertError, Result};
use crate::expiration::{validate_threshold, ExpirationMonitor};
use crate::identity::IdentityProvider;
use crate::lifecycle::{CertificateState, LifecycleManager, LifecycleStateStore, SweepReport};
use crate::logging::OperationTimer;
use crate::metrics::{CertificateMetrics, Outcome};
use crate::provisioner::ProvisionResult;
use crate::queue::{EnqueueOutcome, ProcessingQueue, QueueItem};
use crate::registry::{FactoryRegistry, ProvisionContext};
use crate::status::CertificateStatus;
use crate::tpm::{TpmRenewalProvider, UnavailableTpm};
use crate::validator::{CertificateValidator, ValidationTarget};

/// Name of the provider declaring certificates from the agent config file.
pub const STATIC_PROVIDER: &str = "static";

/// Name of the provider declaring certificates from the drop-in directory.
pub const DROP_IN_PROVIDER: &str = "drop-in";

/// Timing and policy knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    /// Days before expiry at which renewal starts.
    pub renewal_threshold_days: i64,
    /// Interval between full syncs in [`CertManager::run`].
    pub sync_interval: Duration,
    /// Interval between renewal-window checks.
    pub expiration_check_interval: Duration,
    /// Interval between expired-certificate sweeps.
    pub expiration_sweep_interval: Duration,
    /// Delay before polling a pending provisioner again.
    pub requeue_delay: Duration,
    /// Signer named in signing requests.
    pub signer_name: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            renewal_threshold_days: 30,
            sync_interval: Duration::from_secs(60),
            expiration_check_interval: Duration::from_secs(3600),
            expiration_sweep_interval: Duration::from_secs(6 * 3600),
            requeue_delay: Duration::from_secs(10),
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
        }
    }
}

impl ManagerSettings {
    /// Settings from an agent config.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            renewal_threshold_days: config.renewal_threshold_days,
            sync_interval: Duration::from_secs(config.sync_interval_secs),
            expiration_check_interval: Duration::from_secs(config.expiration_check_interval_secs),
            expiration_sweep_interval: Duration::from_secs(config.expiration_sweep_interval_secs),
            requeue_delay: Duration::from_secs(config.requeue_delay_secs),
            signer_name: config.signer_name.clone(),
        }
    }
}

/// Outcome of one [`CertManager::sync`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Certificates examined.
    pub synced: usize,
    /// Keys queued for provisioning or renewal.
    pub queued: Vec<String>,
    /// Keys removed because no provider declares them.
    pub removed: Vec<String>,
    /// Keys or providers that failed, with the error.
    pub failed: Vec<(String, String)>,
    /// Expired-certificate sweep.
    pub sweep: SweepReport,
}

/// Assembles a [`CertManager`].
pub struct CertManagerBuilder {
    identity: Arc<dyn IdentityProvider>,
    client_factory: Arc<dyn ClientFactory>,
    ca_bundle_path: PathBuf,
    registry: Option<FactoryRegistry>,
    providers: Vec<Arc<dyn ConfigProvider>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    tpm: Option<TpmRenewalProvider>,
    monitor: ExpirationMonitor,
    metrics: Option<Arc<CertificateMetrics>>,
    settings: ManagerSettings,
    recovery_retry: BackoffPolicy,
    csr_poll: BackoffPolicy,
}

impl CertManagerBuilder {
    /// Builder with default settings and no providers.
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        client_factory: Arc<dyn ClientFactory>,
        ca_bundle_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            identity,
            client_factory,
            ca_bundle_path: ca_bundle_path.into(),
            registry: None,
            providers: Vec::new(),
            credentials: None,
            tpm: None,
            monitor: ExpirationMonitor::new(),
            metrics: None,
            settings: ManagerSettings::default(),
            recovery_retry: BackoffPolicy::recovery(),
            csr_poll: BackoffPolicy::csr_poll(),
        }
    }

    /// Builder wired from an agent config: static and drop-in providers,
    /// bootstrap credentials, TPM and backoff policies.
    pub fn from_config(
        config: &AgentConfig,
        identity: Arc<dyn IdentityProvider>,
        client_factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let mut builder = Self::new(identity, client_factory, &config.ca_bundle_path)
            .settings(ManagerSettings::from_config(config))
            .recovery_retry(config.recovery_retry.clone())
            .csr_poll(config.csr_poll.clone())
            .credentials(Arc::new(BootstrapCertificateHandler::new(
                config.management.clone(),
                config.bootstrap.clone(),
            )))
            .provider(Arc::new(StaticConfigProvider::new(
                STATIC_PROVIDER,
                config.managed_certificates(),
            )));
        if let Some(dir) = &config.drop_in_dir {
            builder = builder.provider(Arc::new(DropInConfigProvider::new(DROP_IN_PROVIDER, dir)));
        }
        if config.tpm.enabled {
            builder = builder.tpm(TpmRenewalProvider::new(
                Arc::new(UnavailableTpm),
                config.tpm.pcr_selection.clone(),
            ));
        }
        builder
    }

    /// Factory registry; defaults to the built-in types.
    pub fn registry(mut self, registry: FactoryRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Adds a config provider.
    pub fn provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Source of management and bootstrap credentials.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// TPM attestation provider for recovery.
    pub fn tpm(mut self, tpm: TpmRenewalProvider) -> Self {
        self.tpm = Some(tpm);
        self
    }

    /// Clock.
    pub fn monitor(mut self, monitor: ExpirationMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Metrics sink.
    pub fn metrics(mut self, metrics: Arc<CertificateMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Timing settings.
    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Retry policy around recovery attempts.
    pub fn recovery_retry(mut self, policy: BackoffPolicy) -> Self {
        self.recovery_retry = policy;
        self
    }

    /// Poll policy for recovery requests.
    pub fn csr_poll(mut self, policy: BackoffPolicy) -> Self {
        self.csr_poll = policy;
        self
    }

    /// Validates the settings and builds the manager.
    pub fn build(self) -> Result<CertManager> {
        validate_threshold(self.settings.renewal_threshold_days)?;
        self.recovery_retry.validate("recovery_retry")?;
        self.csr_poll.validate("csr_poll")?;
        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name().to_string()) {
                return Err(CertError::Config {
                    reason: format!("duplicate config provider: {}", provider.name()),
                });
            }
        }

        let registry = Arc::new(match self.registry {
            Some(registry) => registry,
            None => FactoryRegistry::with_defaults()?,
        });
        let validator = Arc::new(
            CertificateValidator::new(&self.ca_bundle_path, self.identity.device_name())
                .with_monitor(self.monitor.clone())
                .with_metrics(self.metrics.clone()),
        );

        let mut lifecycle = LifecycleManager::new(
            Arc::new(LifecycleStateStore::new()),
            registry.clone(),
            validator.clone(),
            self.identity.clone(),
            self.client_factory.clone(),
        )
        .with_monitor(self.monitor.clone())
        .with_signer_name(self.settings.signer_name.clone())
        .with_recovery_retry(self.recovery_retry)
        .with_csr_poll(self.csr_poll)
        .with_metrics(self.metrics.clone());
        if let Some(credentials) = &self.credentials {
            lifecycle = lifecycle.with_credentials(credentials.clone());
        }
        if let Some(tpm) = self.tpm {
            lifecycle = lifecycle.with_tpm(tpm);
        }

        Ok(CertManager {
            providers: self.providers,
            certificates: RwLock::new(HashMap::new()),
            registry,
            lifecycle: Arc::new(lifecycle),
            validator,
            identity: self.identity,
            client_factory: self.client_factory,
            credentials: self.credentials,
            queue: ProcessingQueue::new(CancellationToken::new()),
            metrics: self.metrics,
            settings: self.settings,
        })
    }
}

/// Top-level certificate orchestrator.
pub struct CertManager {
    providers: Vec<Arc<dyn ConfigProvider>>,
    certificates: RwLock<HashMap<String, Arc<Certificate>>>,
    registry: Arc<FactoryRegistry>,
    lifecycle: Arc<LifecycleManager>,
    validator: Arc<CertificateValidator>,
    identity: Arc<dyn IdentityProvider>,
    client_factory: Arc<dyn ClientFactory>,
    credentials: Option<Arc<dyn CredentialSource>>,
    queue: ProcessingQueue,
    metrics: Option<Arc<CertificateMetrics>>,
    settings: ManagerSettings,
}

impl fmt::Debug for CertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertManager")
            .field("providers", &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("certificates", &self.certificates.read().len())
            .field("queued", &self.queue.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CertManager {
    /// Lifecycle manager.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Processing queue.
    pub fn queue(&self) -> &ProcessingQueue {
        &self.queue
    }

    /// Settings in effect.
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Registered certificate by provider and name.
    pub fn certificate(&self, provider: &str, name: &str) -> Option<Arc<Certificate>> {
        self.certificates.read().get(&certificate_key(provider, name)).cloned()
    }

    /// Registered certificates, sorted by key.
    pub fn certificates(&self) -> Vec<Arc<Certificate>> {
        let mut certs: Vec<_> = self.certificates.read().values().cloned().collect();
        certs.sort_by_key(|c| c.key());
        certs
    }

    /// Reconciles every provider's declarations, then sweeps for expired certificates.
    ///
    /// One certificate's failure never stops the others; failures are
    /// recorded in lifecycle state and returned in the report.
    pub async fn sync(&self, token: &CancellationToken) -> Result<SyncReport> {
        let mut report = self.sync_declarations(token).await?;
        report.sweep = self.sweep_expired(token).await?;
        for key in &report.sweep.reprovision {
            if !report.queued.contains(key) {
                report.queued.push(key.clone());
            }
        }
        Ok(report)
    }

    /// The declaration pass of [`sync`](Self::sync): provisions, renews and
    /// removes certificates, without the expiration sweep.
    pub async fn sync_declarations(&self, token: &CancellationToken) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut active_providers = HashSet::new();

        for provider in &self.providers {
            if token.is_cancelled() {
                return Err(CertError::Cancelled);
            }
            let name = provider.name().to_string();
            active_providers.insert(name.clone());

            let declared = match provider.certificates().await {
                Ok(declared) => declared,
                Err(e) => {
                    warn!(provider = %name, error = %e, "failed to load certificate declarations");
                    report.failed.push((name, e.to_string()));
                    continue;
                }
            };
            if let Err(e) = validate_certificate_list(&declared) {
                warn!(provider = %name, error = %e, "invalid certificate declarations");
                report.failed.push((name, e.to_string()));
                continue;
            }

            let mut keys = HashSet::new();
            for config in declared {
                let key = certificate_key(&name, &config.name);
                keys.insert(key.clone());
                report.synced += 1;
                match self.sync_certificate(&name, config).await {
                    Ok(true) => report.queued.push(key),
                    Ok(false) => {}
                    Err(e) if matches!(e.root(), CertError::Cancelled) => return Err(e),
                    Err(e) => {
                        warn!(certificate = %key, error = %e, "certificate sync failed");
                        report.failed.push((key, e.to_string()));
                    }
                }
            }

            for cert in self.certificates() {
                if cert.provider() == name && !keys.contains(&cert.key()) {
                    self.remove_certificate(&cert.key()).await;
                    report.removed.push(cert.key());
                }
            }
        }

        for cert in self.certificates() {
            if !active_providers.contains(cert.provider()) {
                self.remove_certificate(&cert.key()).await;
                report.removed.push(cert.key());
            }
        }

        Ok(report)
    }

    /// Runs the expiration sweep. Expired certificates from local
    /// provisioners are queued for reprovisioning; the rest go through
    /// signing-service recovery inside the sweep.
    pub async fn sweep_expired(&self, token: &CancellationToken) -> Result<SweepReport> {
        let report = self
            .lifecycle
            .check_expired_certificates(token, &self.certificates())
            .await?;
        for key in &report.reprovision {
            let Some(cert) = self.certificates.read().get(key).cloned() else {
                continue;
            };
            info!(provider = cert.provider(), certificate = cert.name(), "reprovisioning expired certificate");
            self.enqueue(&cert, cert.config());
        }
        Ok(report)
    }

    /// Brings one declared certificate up to date. Returns whether work was queued.
    pub async fn sync_certificate(&self, provider: &str, config: CertificateConfig) -> Result<bool> {
        let key = certificate_key(provider, &config.name);
        if let Err(e) = self.registry.validate(&config) {
            self.lifecycle.record_error(provider, &config.name, &e);
            return Err(e);
        }

        let cert = match self.certificate(provider, &config.name) {
            Some(cert) => cert,
            None => self.register_certificate(provider, config.clone()).await,
        };

        if self.should_provision_certificate(&cert, &config) {
            debug!(certificate = %key, "certificate needs provisioning");
            return Ok(self.enqueue(&cert, config));
        }

        match self.should_renew_certificate(&cert).await {
            Ok(true) => Ok(self.trigger_renewal(&cert, config)),
            Ok(false) => Ok(false),
            Err(e) => {
                self.lifecycle.record_error(provider, cert.name(), &e);
                Err(e.context(format!("renewal check of {}", key)))
            }
        }
    }

    async fn register_certificate(&self, provider: &str, config: CertificateConfig) -> Arc<Certificate> {
        let cert = Arc::new(Certificate::new(provider, config));
        {
            let mut certs = self.certificates.write();
            if let Some(existing) = certs.get(&cert.key()) {
                return existing.clone();
            }
            certs.insert(cert.key(), cert.clone());
        }
        info!(provider, certificate = cert.name(), "registered certificate");
        self.initialize_certificate(&cert).await;
        cert
    }

    /// Repairs an interrupted swap and loads the active certificate, if any.
    async fn initialize_certificate(&self, cert: &Certificate) {
        let storage = match self.registry.build_storage(&cert.config()) {
            Ok(storage) => storage,
            Err(e) => {
                warn!(certificate = %cert.key(), error = %e, "cannot build storage");
                return;
            }
        };
        let common_name = cert.expected_common_name(self.identity.device_name());
        let target = ValidationTarget {
            provider: cert.provider(),
            certificate: cert.name(),
            common_name: &common_name,
            self_signed: cert.is_self_signed(),
        };
        if let Err(e) = self
            .validator
            .detect_and_recover_incomplete_swap(&target, storage.as_ref())
            .await
        {
            warn!(certificate = %cert.key(), error = %e, "incomplete swap could not be repaired");
        }

        match storage.load_certificate().await {
            Ok(active) => {
                cert.set_info_from(&active);
                debug!(certificate = %cert.key(), not_after = %active.not_after(), "loaded active certificate");
            }
            Err(e) => debug!(certificate = %cert.key(), error = %e, "no active certificate"),
        }
    }

    /// Whether the certificate was never provisioned or its declaration changed.
    pub fn should_provision_certificate(&self, cert: &Certificate, config: &CertificateConfig) -> bool {
        let provisioned = cert
            .info()
            .is_some_and(|info| info.not_before.is_some() && info.not_after.is_some());
        if !provisioned {
            return true;
        }
        cert.config() != *config
    }

    /// Whether the active certificate is inside the renewal window.
    ///
    /// Expired certificates return `false`; the sweep recovers them.
    pub async fn should_renew_certificate(&self, cert: &Certificate) -> Result<bool> {
        let check = self
            .lifecycle
            .check_renewal(cert, self.settings.renewal_threshold_days)
            .await?;
        if check.days_until_expiration < 0 {
            return Ok(false);
        }
        Ok(check.needs_renewal)
    }

    /// Marks the certificate `renewing` and queues the work.
    pub fn trigger_renewal(&self, cert: &Certificate, config: CertificateConfig) -> bool {
        if self.lifecycle.get_state(cert.provider(), cert.name()).state == CertificateState::Recovering {
            return false;
        }
        info!(provider = cert.provider(), certificate = cert.name(), "triggering renewal");
        self.lifecycle
            .set_certificate_state(cert.provider(), cert.name(), CertificateState::Renewing);
        self.enqueue(cert, config)
    }

    fn enqueue(&self, cert: &Certificate, config: CertificateConfig) -> bool {
        match self.queue.enqueue(cert.provider(), config) {
            EnqueueOutcome::Added => true,
            EnqueueOutcome::Unchanged => false,
            EnqueueOutcome::Replaced => {
                cert.reset_handles();
                true
            }
        }
    }

    async fn management_client(&self) -> Option<Arc<dyn ManagementClient>> {
        let credential = match &self.credentials {
            Some(source) => match source.credential_for_auth().await {
                Ok(auth) => {
                    debug!(method = auth.method.as_str(), "authenticating with certificate");
                    Some(auth.tls.to_client_credential())
                }
                Err(e) => {
                    debug!(error = %e, "no client certificate available");
                    None
                }
            },
            None => None,
        };
        match self.client_factory.client(credential.as_ref()) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "cannot build management client");
                None
            }
        }
    }

    /// Processes one queue item under the certificate's operation lock.
    ///
    /// Pending provisioners are requeued after the requeue delay. On error
    /// the handles are dropped so the next attempt starts from scratch.
    pub async fn ensure_certificate(&self, item: &QueueItem) -> Result<()> {
        let Some(cert) = self.certificates.read().get(&item.key).cloned() else {
            self.queue.complete(item);
            return Ok(());
        };

        let _guard = tokio::select! {
            guard = cert.op_lock().lock() => guard,
            _ = item.token.cancelled() => {
                self.queue.complete(item);
                return Err(CertError::Cancelled);
            }
        };

        match self.ensure_certificate_do(item, &cert).await {
            Ok(true) => {
                self.queue.complete(item);
                Ok(())
            }
            Ok(false) => {
                self.queue.requeue(item, self.settings.requeue_delay);
                Ok(())
            }
            Err(e) => {
                cert.reset_handles();
                self.queue.complete(item);
                if matches!(e.root(), CertError::Cancelled) {
                    debug!(certificate = %item.key, "queued work cancelled");
                    return Err(e);
                }
                self.lifecycle.record_error(cert.provider(), cert.name(), &e);
                Err(e.context(format!("ensure certificate {}", item.key)))
            }
        }
    }

    /// Provisions once. Returns `Ok(false)` while the provisioner is pending.
    ///
    /// First-time provisioning writes the active pair directly. Replacing an
    /// existing certificate always goes through pending, validation and swap.
    async fn ensure_certificate_do(&self, item: &QueueItem, cert: &Certificate) -> Result<bool> {
        let renewing = cert.info().is_some();
        let (provisioner, storage) = match (cert.provisioner(), cert.storage()) {
            (Some(provisioner), Some(storage)) => (provisioner, storage),
            _ => {
                let storage = self.registry.build_storage(&item.config)?;
                let ctx = ProvisionContext {
                    identity: self.identity.clone(),
                    client: self.management_client().await,
                    renewing,
                    default_signer: self.settings.signer_name.clone(),
                };
                let provisioner = self.registry.build_provisioner(&item.config, &ctx)?;
                cert.set_handles(provisioner.clone(), storage.clone());
                (provisioner, storage)
            }
        };

        let timer = OperationTimer::start(
            if renewing { "renew_certificate" } else { "provision_certificate" },
            cert.provider(),
            cert.name(),
        )
        .with_metrics(self.metrics.clone());

        let issued = match provisioner.provision(&item.token).await {
            Ok(ProvisionResult::Pending) => {
                debug!(certificate = %item.key, "provisioning pending, requeueing");
                return Ok(false);
            }
            Ok(ProvisionResult::Ready(issued)) => issued,
            Err(e) => {
                self.record_outcome(renewing, Outcome::Failure);
                return timer.finish(Err(e));
            }
        };

        let installed = if renewing {
            let common_name = provisioner.expected_common_name().to_string();
            let target = ValidationTarget {
                provider: cert.provider(),
                certificate: cert.name(),
                common_name: &common_name,
                self_signed: provisioner.is_self_signed(),
            };
            self.validator.install_pending(&target, storage.as_ref(), &issued).await
        } else {
            storage.write(&issued.cert, &issued.key_pem).await
        };
        if let Err(e) = installed {
            self.record_outcome(renewing, Outcome::Failure);
            return timer.finish(Err(e));
        }

        cert.set_config(item.config.clone());
        cert.reset_handles();
        if renewing {
            cert.record_renewed(self.lifecycle.monitor().now());
        }
        let days = self.lifecycle.record_installed(cert, &issued.cert)?;
        self.record_outcome(renewing, Outcome::Success);
        info!(
            provider = cert.provider(),
            certificate = cert.name(),
            renewing,
            days_until_expiration = days,
            "certificate installed"
        );
        timer.finish(Ok(true))
    }

    fn record_outcome(&self, renewing: bool, outcome: Outcome) {
        if let Some(metrics) = &self.metrics {
            if renewing {
                metrics.record_renewal(outcome);
            } else {
                metrics.record_provision(outcome);
            }
        }
    }

    /// Drops a certificate: cancels queued work, deletes its files and
    /// forgets its state. Storage errors are logged.
    pub async fn remove_certificate(&self, key: &str) -> bool {
        self.queue.cancel(key);
        let Some(cert) = self.certificates.write().remove(key) else {
            return false;
        };
        let _guard = cert.op_lock().lock().await;

        let storage = match cert.storage() {
            Some(storage) => Ok(storage),
            None => self.registry.build_storage(&cert.config()),
        };
        match storage {
            Ok(storage) => {
                if let Err(e) = storage.delete().await {
                    warn!(certificate = %key, error = %e, "failed to delete certificate files");
                }
            }
            Err(e) => warn!(certificate = %key, error = %e, "cannot build storage for removal"),
        }
        cert.reset_handles();
        self.lifecycle.store().remove(key);
        if let Some(metrics) = &self.metrics {
            metrics.remove_certificate(cert.provider(), cert.name());
        }
        info!(certificate = %key, "removed certificate");
        true
    }

    /// Registers every declared certificate and refreshes its state from
    /// storage without queueing work.
    pub async fn inspect(&self) -> Result<Vec<CertificateStatus>> {
        for provider in &self.providers {
            let declared = provider.certificates().await?;
            for config in declared {
                let cert = match self.certificate(provider.name(), &config.name) {
                    Some(cert) => cert,
                    None => self.register_certificate(provider.name(), config).await,
                };
                if cert.info().is_some() {
                    if let Err(e) = self
                        .lifecycle
                        .check_renewal(&cert, self.settings.renewal_threshold_days)
                        .await
                    {
                        self.lifecycle.record_error(cert.provider(), cert.name(), &e);
                    }
                }
            }
        }
        Ok(self.status())
    }

    /// Renewal-window check for every registered certificate.
    pub async fn check_renewals(&self) -> Vec<(String, String)> {
        let mut failed = Vec::new();
        for cert in self.certificates() {
            if cert.info().is_none() {
                continue;
            }
            match self.should_renew_certificate(&cert).await {
                Ok(true) => {
                    self.trigger_renewal(&cert, cert.config());
                }
                Ok(false) => {}
                Err(e) => {
                    self.lifecycle.record_error(cert.provider(), cert.name(), &e);
                    failed.push((cert.key(), e.to_string()));
                }
            }
        }
        failed
    }

    /// One status entry per registered certificate.
    pub fn status(&self) -> Vec<CertificateStatus> {
        self.certificates()
            .into_iter()
            .map(|cert| {
                let state = self.lifecycle.get_state(cert.provider(), cert.name());
                CertificateStatus {
                    provider: cert.provider().to_string(),
                    name: cert.name().to_string(),
                    state: state.state,
                    expiration_time: state
                        .expiration_time
                        .or_else(|| cert.info().and_then(|i| i.not_after)),
                    days_until_expiration: state.days_until_expiration,
                    last_renewed: cert.last_renewed(),
                    renewal_count: cert.renewal_count(),
                    last_error: state.last_error,
                }
            })
            .collect()
    }

    /// Spawns the queue worker and the two tickers. All stop with `token`.
    pub fn start(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let worker = {
            let this = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                while let Some(item) = this.queue.next(&token).await {
                    if let Err(e) = this.ensure_certificate(&item).await {
                        if !matches!(e.root(), CertError::Cancelled) {
                            warn!(certificate = %item.key, error = %e, "queued work failed");
                        }
                    }
                }
                debug!("queue worker stopped");
            })
        };

        let renewal_ticker = {
            let this = self.clone();
            let token = token.clone();
            let period = self.settings.expiration_check_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let failed = this.check_renewals().await;
                            if !failed.is_empty() {
                                warn!(count = failed.len(), "renewal checks failed");
                            }
                        }
                    }
                }
                debug!("renewal ticker stopped");
            })
        };

        let sweep_ticker = {
            let this = self.clone();
            let token = token.clone();
            let period = self.settings.expiration_sweep_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            match this.sweep_expired(&token).await {
                                Ok(report) if !report.failed.is_empty() => {
                                    warn!(failed = report.failed.len(), "expiration sweep had failures");
                                }
                                Ok(_) => {}
                                Err(e) => debug!(error = %e, "expiration sweep stopped"),
                            }
                        }
                    }
                }
                debug!("expiration sweep stopped");
            })
        };

        vec![worker, renewal_ticker, sweep_ticker]
    }

    /// Starts background tasks and syncs every sync interval until `token` is cancelled.
    ///
    /// Each pass reconciles declarations inline and runs the expiration
    /// sweep as its own task, so a long recovery never delays the next
    /// declaration pass. Sweeps skip certificates whose recovery is still
    /// in flight.
    pub async fn run(self: &Arc<Self>, token: CancellationToken) -> Result<()> {
        let tasks = self.start(&token);
        let mut sweeps = JoinSet::new();
        let mut interval = tokio::time::interval(self.settings.sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(joined) = sweeps.join_next(), if !sweeps.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "expiration sweep ended abnormally");
                    }
                }
                _ = interval.tick() => {
                    match self.sync_declarations(&token).await {
                        Ok(report) => debug!(
                            synced = report.synced,
                            queued = report.queued.len(),
                            removed = report.removed.len(),
                            failed = report.failed.len(),
                            "sync complete"
                        ),
                        Err(e) if matches!(e.root(), CertError::Cancelled) => break,
                        Err(e) => warn!(error = %e, "sync failed"),
                    }
                    let this = self.clone();
                    let sweep_token = token.clone();
                    sweeps.spawn(async move {
                        match this.sweep_expired(&sweep_token).await {
                            Ok(report) if !report.failed.is_empty() => {
                                warn!(failed = report.failed.len(), "expiration sweep had failures");
                            }
                            Ok(_) => {}
                            Err(e) => debug!(error = %e, "expiration sweep stopped"),
                        }
                    });
                }
            }
        }
        while let Some(joined) = sweeps.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "expiration sweep ended abnormally");
            }
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("certificate manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CertKeyPaths, TypedConfig};
    use crate::identity::FileIdentityProvider;
    use edgecert_api::{ApiError, ApiResult, ClientCredential};
    use tempfile::TempDir;

    struct NoClients;

    impl ClientFactory for NoClients {
        fn client(&self, _credential: Option<&ClientCredential>) -> ApiResult<Arc<dyn ManagementClient>> {
            Err(ApiError::Transport {
                reason: "offline".to_string(),
            })
        }
    }

    fn self_signed(dir: &std::path::Path, name: &str, days: u64) -> CertificateConfig {
        CertificateConfig {
            name: name.to_string(),
            provisioner: TypedConfig::new(
                "self-signed",
                serde_json::json!({ "common_name": name, "validity_days": days }),
            ),
            storage: CertificateConfig::filesystem_storage(&CertKeyPaths {
                cert_path: dir.join(format!("{}.crt", name)),
                key_path: dir.join(format!("{}.key", name)),
            }),
        }
    }

    async fn manager(dir: &TempDir, certs: Vec<CertificateConfig>) -> CertManager {
        let identity = Arc::new(
            FileIdentityProvider::load_or_create(&dir.path().join("device.key"))
                .await
                .unwrap(),
        );
        CertManagerBuilder::new(identity, Arc::new(NoClients), dir.path().join("ca.crt"))
            .provider(Arc::new(StaticConfigProvider::new("static", certs)))
            .build()
            .unwrap()
    }

    async fn drain(manager: &CertManager) {
        let token = CancellationToken::new();
        while !manager.queue().is_empty() {
            let item = manager.queue().next(&token).await.unwrap();
            manager.ensure_certificate(&item).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sync_provisions_new_certificate() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, vec![self_signed(dir.path(), "web", 90)]).await;
        let token = CancellationToken::new();

        let report = manager.sync(&token).await.unwrap();
        assert_eq!(report.queued, vec!["static/web".to_string()]);
        drain(&manager).await;

        let cert = manager.certificate("static", "web").unwrap();
        assert!(cert.info().is_some());
        assert!(!cert.has_handles());
        assert!(dir.path().join("web.crt").exists());

        let report = manager.sync(&token).await.unwrap();
        assert!(report.queued.is_empty());
        let status = manager.status();
        assert_eq!(status[0].state, CertificateState::Normal);
        assert!((88..=90).contains(&status[0].days_until_expiration));
    }

    #[tokio::test]
    async fn test_renewal_goes_through_swap() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, vec![self_signed(dir.path(), "web", 10)]).await;
        let token = CancellationToken::new();
        manager.sync(&token).await.unwrap();
        drain(&manager).await;
        let first = std::fs::read(dir.path().join("web.crt")).unwrap();

        let report = manager.sync(&token).await.unwrap();
        assert_eq!(report.queued, vec!["static/web".to_string()]);
        assert_eq!(
            manager.lifecycle().get_state("static", "web").state,
            CertificateState::Renewing
        );
        drain(&manager).await;

        let cert = manager.certificate("static", "web").unwrap();
        assert_eq!(cert.renewal_count(), 1);
        assert_ne!(std::fs::read(dir.path().join("web.crt")).unwrap(), first);
        assert!(dir.path().join("web.crt.backup").exists());
        assert!(!dir.path().join("web.crt.pending").exists());
        assert_eq!(
            manager.lifecycle().get_state("static", "web").state,
            CertificateState::Normal
        );
    }

    #[tokio::test]
    async fn test_expired_self_signed_reprovisioned_through_queue() {
        let dir = TempDir::new().unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(rcgen::DnType::CommonName, "web");
        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now - ::time::Duration::days(40);
        params.not_after = now - ::time::Duration::days(10);
        let expired = params.self_signed(&key).unwrap().pem();
        std::fs::write(dir.path().join("web.crt"), &expired).unwrap();
        std::fs::write(dir.path().join("web.key"), key.serialize_pem()).unwrap();

        let manager = manager(&dir, vec![self_signed(dir.path(), "web", 90)]).await;
        let token = CancellationToken::new();
        let report = manager.sync(&token).await.unwrap();

        assert_eq!(report.sweep.expired, vec!["static/web".to_string()]);
        assert_eq!(report.sweep.reprovision, vec!["static/web".to_string()]);
        assert!(report.sweep.failed.is_empty());
        assert_eq!(report.queued, vec!["static/web".to_string()]);
        assert_eq!(
            manager.lifecycle().get_state("static", "web").state,
            CertificateState::Recovering
        );
        drain(&manager).await;

        let pem = std::fs::read(dir.path().join("web.crt")).unwrap();
        let active = crate::x509::CertificateData::from_pem(&pem).unwrap();
        assert!(active.is_valid_at(chrono::Utc::now()));
        assert_eq!(std::fs::read_to_string(dir.path().join("web.crt.backup")).unwrap(), expired);
        let state = manager.lifecycle().get_state("static", "web");
        assert_eq!(state.state, CertificateState::Normal);
        assert!(state.last_error.is_none());

        let report = manager.sync(&token).await.unwrap();
        assert!(report.queued.is_empty());
        assert!(report.sweep.expired.is_empty());
    }

    #[tokio::test]
    async fn test_config_change_wins_over_renewal() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, vec![self_signed(dir.path(), "web", 200)]).await;
        let token = CancellationToken::new();
        manager.sync(&token).await.unwrap();
        drain(&manager).await;

        let cert = manager.certificate("static", "web").unwrap();
        assert!(!manager.should_provision_certificate(&cert, &self_signed(dir.path(), "web", 200)));
        assert!(manager.should_provision_certificate(&cert, &self_signed(dir.path(), "web", 300)));
    }

    #[tokio::test]
    async fn test_removal_cleans_up() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(crate::config_provider::DropInConfigProvider::new(
            "drop-in",
            dir.path().join("conf.d"),
        ));
        std::fs::create_dir(dir.path().join("conf.d")).unwrap();
        let declared = serde_json::json!({ "certificates": [self_signed(dir.path(), "web", 90)] });
        std::fs::write(dir.path().join("conf.d/web.json"), declared.to_string()).unwrap();

        let identity = Arc::new(
            FileIdentityProvider::load_or_create(&dir.path().join("device.key"))
                .await
                .unwrap(),
        );
        let manager = CertManagerBuilder::new(identity, Arc::new(NoClients), dir.path().join("ca.crt"))
            .provider(provider)
            .build()
            .unwrap();
        let token = CancellationToken::new();
        manager.sync(&token).await.unwrap();
        drain(&manager).await;
        assert!(dir.path().join("web.crt").exists());

        std::fs::remove_file(dir.path().join("conf.d/web.json")).unwrap();
        let report = manager.sync(&token).await.unwrap();
        assert_eq!(report.removed, vec!["drop-in/web".to_string()]);
        assert!(manager.certificate("drop-in", "web").is_none());
        assert!(!dir.path().join("web.crt").exists());
        assert!(!manager.lifecycle().store().contains("drop-in/web"));
    }

    #[tokio::test]
    async fn test_failed_provision_resets_handles() {
        let dir = TempDir::new().unwrap();
        let csr = CertificateConfig {
            name: "management".to_string(),
            provisioner: TypedConfig::new("csr", serde_json::json!({})),
            storage: CertificateConfig::filesystem_storage(&CertKeyPaths {
                cert_path: dir.path().join("m.crt"),
                key_path: dir.path().join("m.key"),
            }),
        };
        let manager = manager(&dir, vec![csr]).await;
        let token = CancellationToken::new();
        manager.sync(&token).await.unwrap();

        let item = manager.queue().next(&token).await.unwrap();
        let err = manager.ensure_certificate(&item).await.unwrap_err();
        assert!(err.to_string().contains("no authenticated management client"));
        let cert = manager.certificate("static", "management").unwrap();
        assert!(!cert.has_handles());
        assert!(manager.queue().is_empty());
        assert!(manager
            .lifecycle()
            .get_state("static", "management")
            .last_error
            .is_some());
    }

    #[tokio::test]
    async fn test_unknown_type_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut bad = self_signed(dir.path(), "bad", 90);
        bad.provisioner.kind = "acme".to_string();
        let manager = manager(&dir, vec![bad, self_signed(dir.path(), "good", 90)]).await;
        let report = manager.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("unknown provisioner type: acme"));
        assert_eq!(report.queued, vec!["static/good".to_string()]);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let identity = Arc::new(
            FileIdentityProvider::from_pem(zeroize::Zeroizing::new(
                rcgen::KeyPair::generate().unwrap().serialize_pem(),
            ))
            .unwrap(),
        );
        let err = CertManagerBuilder::new(identity, Arc::new(NoClients), "/tmp/ca.crt")
            .provider(Arc::new(StaticConfigProvider::new("static", vec![])))
            .provider(Arc::new(StaticConfigProvider::new("static", vec![])))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate config provider"));
    }
}
