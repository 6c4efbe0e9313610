//! Shared fixtures: a device directory, an in-process signing service and
//! a manager wired the way `ecert-agent run` wires it.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use edgecert_agent::{
    AgentConfig, BackoffPolicy, CertKeyPaths, CertManager, CertManagerBuilder, FileIdentityProvider,
    IdentityProvider,
};
use edgecert_signer::{InProcessClientFactory, SigningCa, SigningService};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const SIGNER: &str = "edgecert.io/device-management";

pub struct Device {
    pub dir: TempDir,
    pub identity: Arc<FileIdentityProvider>,
    pub service: Arc<SigningService>,
    pub clients: InProcessClientFactory,
    pub config: AgentConfig,
}

impl Device {
    /// A device with a generated identity and a fresh fleet CA. The CA
    /// bundle is written; no certificates are installed.
    pub async fn new() -> Self {
        Self::with_service(|service| service.with_auto_approve_enrollment(true)).await
    }

    pub async fn with_service(configure: impl FnOnce(SigningService) -> SigningService) -> Self {
        let dir = TempDir::new().unwrap();
        let identity = Arc::new(
            FileIdentityProvider::load_or_create(&dir.path().join("device.key"))
                .await
                .unwrap(),
        );
        let service = Arc::new(configure(SigningService::new(
            SigningCa::generate("Fleet CA").unwrap(),
            SIGNER,
        )));
        std::fs::write(dir.path().join("ca.crt"), service.ca().bundle_pem()).unwrap();

        let config = AgentConfig {
            data_dir: dir.path().to_path_buf(),
            device_key_path: dir.path().join("device.key"),
            ca_bundle_path: dir.path().join("ca.crt"),
            management: paths(dir.path(), "management"),
            bootstrap: Some(paths(dir.path(), "bootstrap")),
            requeue_delay_secs: 0,
            recovery_retry: fast_policy(3),
            csr_poll: fast_policy(5),
            ..AgentConfig::default()
        };
        Self {
            clients: InProcessClientFactory::new(service.clone()),
            dir,
            identity,
            service,
            config,
        }
    }

    pub fn device_name(&self) -> String {
        self.identity.device_name().to_string()
    }

    pub fn path(&self, file: &str) -> std::path::PathBuf {
        self.dir.path().join(file)
    }

    /// Installs a CA-issued pair for `stem` valid from `from_days` to `to_days` relative to now.
    pub fn install(&self, stem: &str, common_name: &str, from_days: i64, to_days: i64) -> String {
        let now = Utc::now();
        let pair = self
            .service
            .ca()
            .issue(common_name, now + Duration::days(from_days), now + Duration::days(to_days))
            .unwrap();
        std::fs::write(self.path(&format!("{}.crt", stem)), &pair.cert_pem).unwrap();
        std::fs::write(self.path(&format!("{}.key", stem)), &pair.key_pem).unwrap();
        pair.cert_pem
    }

    pub fn install_bootstrap(&self) {
        let name = self.device_name();
        self.install("bootstrap", &name, -1, 365);
    }

    pub fn manager(&self) -> CertManager {
        self.builder().build().unwrap()
    }

    pub fn builder(&self) -> CertManagerBuilder {
        CertManagerBuilder::from_config(&self.config, self.identity.clone(), Arc::new(self.clients.clone()))
    }
}

pub fn paths(dir: &Path, stem: &str) -> CertKeyPaths {
    CertKeyPaths {
        cert_path: dir.join(format!("{}.crt", stem)),
        key_path: dir.join(format!("{}.key", stem)),
    }
}

pub fn fast_policy(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        initial_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 4,
        max_attempts,
    }
}

/// Processes queued work until the queue is empty.
pub async fn drain(manager: &CertManager) {
    let token = CancellationToken::new();
    while !manager.queue().is_empty() {
        let item = tokio::time::timeout(std::time::Duration::from_secs(5), manager.queue().next(&token))
            .await
            .unwrap()
            .unwrap();
        manager.ensure_certificate(&item).await.unwrap();
    }
}
