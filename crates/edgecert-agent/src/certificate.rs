//! Runtime record of one managed certificate.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::config::CertificateConfig;
use crate::provisioner::{Provisioner, SELF_SIGNED_PROVISIONER};
use crate::storage::StorageProvider;
use crate::x509::CertificateData;

/// Validity window of the active certificate, once known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Start of validity.
    pub not_before: Option<DateTime<Utc>>,
    /// End of validity.
    pub not_after: Option<DateTime<Utc>>,
}

impl CertificateInfo {
    /// Window of `cert`.
    pub fn of(cert: &CertificateData) -> Self {
        Self {
            not_before: Some(cert.not_before()),
            not_after: Some(cert.not_after()),
        }
    }
}

struct Fields {
    config: CertificateConfig,
    info: Option<CertificateInfo>,
    provisioner: Option<Arc<dyn Provisioner>>,
    storage: Option<Arc<dyn StorageProvider>>,
    renewal_count: u64,
    last_renewed: Option<DateTime<Utc>>,
}

/// One managed certificate.
///
/// Field access is guarded by a short-lived lock. Long operations that
/// touch storage take `op_lock` so at most one provisioning, renewal or
/// recovery runs per certificate.
pub struct Certificate {
    name: String,
    provider: String,
    op_lock: Mutex<()>,
    fields: RwLock<Fields>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields.read();
        f.debug_struct("Certificate")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("info", &fields.info)
            .field("has_provisioner", &fields.provisioner.is_some())
            .field("has_storage", &fields.storage.is_some())
            .field("renewal_count", &fields.renewal_count)
            .finish()
    }
}

impl Certificate {
    /// New record for `config` declared by `provider`.
    pub fn new(provider: impl Into<String>, config: CertificateConfig) -> Self {
        Self {
            name: config.name.clone(),
            provider: provider.into(),
            op_lock: Mutex::new(()),
            fields: RwLock::new(Fields {
                config,
                info: None,
                provisioner: None,
                storage: None,
                renewal_count: 0,
                last_renewed: None,
            }),
        }
    }

    /// Certificate name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the config provider that declared it.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Queue and lifecycle key.
    pub fn key(&self) -> String {
        certificate_key(&self.provider, &self.name)
    }

    /// Current declaration.
    pub fn config(&self) -> CertificateConfig {
        self.fields.read().config.clone()
    }

    /// Replaces the declaration.
    pub fn set_config(&self, config: CertificateConfig) {
        self.fields.write().config = config;
    }

    /// Validity of the active certificate.
    pub fn info(&self) -> Option<CertificateInfo> {
        self.fields.read().info
    }

    /// Records the validity of `cert` as active.
    pub fn set_info_from(&self, cert: &CertificateData) {
        self.fields.write().info = Some(CertificateInfo::of(cert));
    }

    /// Forgets the active certificate.
    pub fn clear_info(&self) {
        self.fields.write().info = None;
    }

    /// Provisioner handle.
    pub fn provisioner(&self) -> Option<Arc<dyn Provisioner>> {
        self.fields.read().provisioner.clone()
    }

    /// Storage handle.
    pub fn storage(&self) -> Option<Arc<dyn StorageProvider>> {
        self.fields.read().storage.clone()
    }

    /// Installs storage only, leaving the provisioner as is.
    pub fn set_storage(&self, storage: Arc<dyn StorageProvider>) {
        self.fields.write().storage = Some(storage);
    }

    /// Installs both handles.
    pub fn set_handles(&self, provisioner: Arc<dyn Provisioner>, storage: Arc<dyn StorageProvider>) {
        let mut fields = self.fields.write();
        fields.provisioner = Some(provisioner);
        fields.storage = Some(storage);
    }

    /// Drops both handles.
    pub fn reset_handles(&self) {
        let mut fields = self.fields.write();
        fields.provisioner = None;
        fields.storage = None;
    }

    /// Whether an operation holds either handle.
    pub fn has_handles(&self) -> bool {
        let fields = self.fields.read();
        fields.provisioner.is_some() || fields.storage.is_some()
    }

    /// Per-certificate operation lock.
    pub fn op_lock(&self) -> &Mutex<()> {
        &self.op_lock
    }

    /// Counts a successful renewal at `at`.
    pub fn record_renewed(&self, at: DateTime<Utc>) {
        let mut fields = self.fields.write();
        fields.renewal_count += 1;
        fields.last_renewed = Some(at);
    }

    /// Common name issued certificates must carry: the declared
    /// `common_name`, or the device name.
    pub fn expected_common_name(&self, device_name: &str) -> String {
        self.fields
            .read()
            .config
            .provisioner
            .param_str("common_name")
            .unwrap_or(device_name)
            .to_string()
    }

    /// Whether the declared provisioner mints self-signed certificates.
    pub fn is_self_signed(&self) -> bool {
        self.fields.read().config.provisioner.kind == SELF_SIGNED_PROVISIONER
    }

    /// Successful renewals so far.
    pub fn renewal_count(&self) -> u64 {
        self.fields.read().renewal_count
    }

    /// Time of the last successful renewal.
    pub fn last_renewed(&self) -> Option<DateTime<Utc>> {
        self.fields.read().last_renewed
    }
}

/// Key used by the queue and lifecycle store.
pub fn certificate_key(provider: &str, name: &str) -> String {
    format!("{}/{}", provider, name)
}
