//! Agent configuration loaded from TOML or JSON.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{CertError, Result};
use crate::expiration::validate_threshold;
use crate::logging::LogFormat;

/// Name of the certificate that authenticates the device to the service.
pub const MANAGEMENT_CERT_NAME: &str = "management";

/// Default signer for device management certificates.
pub const DEFAULT_SIGNER_NAME: &str = "edgecert.io/device-management";

/// A certificate and key file pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertKeyPaths {
    /// PEM certificate path.
    pub cert_path: PathBuf,
    /// PEM private key path.
    pub key_path: PathBuf,
}

/// TPM settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpmConfig {
    /// Whether hardware attestation may be used for recovery.
    pub enabled: bool,
    /// PCRs included in attestation quotes.
    pub pcr_selection: Vec<u32>,
}

/// A factory type tag with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedConfig {
    /// Registered type tag, such as `csr` or `filesystem`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TypedConfig {
    /// Creates a typed config from a tag and JSON parameters.
    pub fn new(kind: &str, params: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            params,
        }
    }

    /// String parameter `key`, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Unsigned integer parameter `key`, if present.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    /// Required string parameter.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.param_str(key).ok_or_else(|| CertError::Config {
            reason: format!("{} requires string parameter '{}'", self.kind, key),
        })
    }
}

/// One managed certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Certificate name, unique per provider.
    pub name: String,
    /// How the certificate is obtained.
    pub provisioner: TypedConfig,
    /// Where the certificate is kept.
    pub storage: TypedConfig,
}

impl CertificateConfig {
    /// Filesystem storage parameters for a cert/key pair.
    pub fn filesystem_storage(paths: &CertKeyPaths) -> TypedConfig {
        TypedConfig::new(
            "filesystem",
            serde_json::json!({
                "cert_path": paths.cert_path,
                "key_path": paths.key_path,
            }),
        )
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// State directory.
    pub data_dir: PathBuf,
    /// Device identity key.
    pub device_key_path: PathBuf,
    /// CA bundle that issued certificates must chain to.
    pub ca_bundle_path: PathBuf,
    /// Management certificate files.
    pub management: CertKeyPaths,
    /// Long-lived enrollment certificate, if provisioned.
    pub bootstrap: Option<CertKeyPaths>,
    /// Hardware attestation settings.
    pub tpm: TpmConfig,
    /// Renew when this many days or fewer remain.
    pub renewal_threshold_days: i64,
    /// Seconds between configuration syncs.
    pub sync_interval_secs: u64,
    /// Seconds between renewal checks.
    pub expiration_check_interval_secs: u64,
    /// Seconds between full expiration sweeps.
    pub expiration_sweep_interval_secs: u64,
    /// Seconds before a pending provision is retried.
    pub requeue_delay_secs: u64,
    /// Retry policy for expired-certificate recovery.
    pub recovery_retry: BackoffPolicy,
    /// Polling policy for issued certificates.
    pub csr_poll: BackoffPolicy,
    /// Management service base URL.
    pub server_url: String,
    /// Signer requested for management certificates.
    pub signer_name: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Certificates declared inline.
    pub certificates: Vec<CertificateConfig>,
    /// Directory of additional certificate declarations.
    pub drop_in_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("/var/lib/edgecert");
        Self {
            device_key_path: data_dir.join("device.key"),
            ca_bundle_path: data_dir.join("ca.crt"),
            management: CertKeyPaths {
                cert_path: data_dir.join("management.crt"),
                key_path: data_dir.join("management.key"),
            },
            data_dir,
            bootstrap: None,
            tpm: TpmConfig::default(),
            renewal_threshold_days: 30,
            sync_interval_secs: 60,
            expiration_check_interval_secs: 3600,
            expiration_sweep_interval_secs: 21600,
            requeue_delay_secs: 10,
            recovery_retry: BackoffPolicy::recovery(),
            csr_poll: BackoffPolicy::csr_poll(),
            server_url: "https://localhost:3443".to_string(),
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            log_format: LogFormat::Text,
            certificates: Vec::new(),
            drop_in_dir: None,
        }
    }
}

impl AgentConfig {
    /// Loads and validates a config file, choosing the format by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents, path)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(contents).map_err(|e| CertError::Config {
                reason: format!("{}: {}", path.display(), e),
            }),
            "json" => serde_json::from_str(contents).map_err(|e| CertError::Config {
                reason: format!("{}: {}", path.display(), e),
            }),
            _ => Err(CertError::Config {
                reason: format!("unsupported config file extension: {}", ext),
            }),
        }
    }

    /// Rejects configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.renewal_threshold_days)?;

        let intervals = [
            ("sync_interval_secs", self.sync_interval_secs),
            ("expiration_check_interval_secs", self.expiration_check_interval_secs),
            ("expiration_sweep_interval_secs", self.expiration_sweep_interval_secs),
            ("requeue_delay_secs", self.requeue_delay_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(CertError::Config {
                    reason: format!("{} must be greater than zero", name),
                });
            }
        }

        self.recovery_retry.validate("recovery_retry")?;
        self.csr_poll.validate("csr_poll")?;
        validate_certificate_list(&self.certificates)
    }

    /// Inline certificates plus the management certificate.
    ///
    /// The management certificate is added as a `csr`/`filesystem` entry
    /// unless one named [`MANAGEMENT_CERT_NAME`] is already declared.
    pub fn managed_certificates(&self) -> Vec<CertificateConfig> {
        let mut certs = self.certificates.clone();
        if !certs.iter().any(|c| c.name == MANAGEMENT_CERT_NAME) {
            certs.insert(0, self.management_certificate());
        }
        certs
    }

    /// Default declaration of the management certificate.
    pub fn management_certificate(&self) -> CertificateConfig {
        CertificateConfig {
            name: MANAGEMENT_CERT_NAME.to_string(),
            provisioner: TypedConfig::new(
                "csr",
                serde_json::json!({ "signer_name": self.signer_name }),
            ),
            storage: CertificateConfig::filesystem_storage(&self.management),
        }
    }
}

/// Rejects empty names, empty type tags and duplicate names.
pub fn validate_certificate_list(certs: &[CertificateConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for cert in certs {
        if cert.name.trim().is_empty() {
            return Err(CertError::Config {
                reason: "certificate name must not be empty".to_string(),
            });
        }
        if cert.provisioner.kind.is_empty() || cert.storage.kind.is_empty() {
            return Err(CertError::Config {
                reason: format!("certificate {} needs provisioner and storage types", cert.name),
            });
        }
        if !seen.insert(cert.name.as_str()) {
            return Err(CertError::Config {
                reason: format!("duplicate certificate name: {}", cert.name),
            });
        }
    }
    Ok(())
}
