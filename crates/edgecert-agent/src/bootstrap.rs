//! Bootstrap (enrollment) certificate handling.
//!
//! The bootstrap certificate is long-lived and only used to authenticate
//! when the management certificate can no longer be presented.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::CertKeyPaths;
use crate::error::{CertError, Result, ValidationStage};
use crate::expiration::ExpirationMonitor;
use crate::tls::TlsCredential;
use crate::x509::CertificateData;

/// Which certificate authenticates a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// The active management certificate.
    Management,
    /// The bootstrap certificate.
    Bootstrap,
}

impl AuthMethod {
    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Management => "management",
            AuthMethod::Bootstrap => "bootstrap",
        }
    }
}

/// A TLS credential and the certificate it came from.
#[derive(Debug, Clone)]
pub struct AuthCredential {
    /// Source of the credential.
    pub method: AuthMethod,
    /// Certificate chain and key.
    pub tls: TlsCredential,
}

/// Capability consumed by recovery to pick and obtain an auth credential.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Whether a usable fallback credential exists.
    async fn has_valid_credential(&self) -> bool;

    /// Best credential currently available.
    async fn credential_for_auth(&self) -> Result<AuthCredential>;
}

/// Loads management and bootstrap certificates from disk and picks one for auth.
#[derive(Debug, Clone)]
pub struct BootstrapCertificateHandler {
    management: CertKeyPaths,
    bootstrap: Option<CertKeyPaths>,
    monitor: ExpirationMonitor,
}

impl BootstrapCertificateHandler {
    /// Handler for the given management and optional bootstrap paths.
    pub fn new(management: CertKeyPaths, bootstrap: Option<CertKeyPaths>) -> Self {
        Self {
            management,
            bootstrap,
            monitor: ExpirationMonitor::new(),
        }
    }

    /// Uses `monitor` for validity checks.
    pub fn with_monitor(mut self, monitor: ExpirationMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    fn bootstrap_paths(&self) -> Result<&CertKeyPaths> {
        self.bootstrap.as_ref().ok_or_else(|| CertError::Config {
            reason: "no bootstrap certificate configured".to_string(),
        })
    }

    /// Reads and parses the bootstrap certificate.
    pub async fn load_bootstrap_certificate(&self) -> Result<CertificateData> {
        let paths = self.bootstrap_paths()?;
        let pem = read(&paths.cert_path, "load_bootstrap_certificate").await?;
        CertificateData::from_pem(&pem)
    }

    /// Rejects a bootstrap certificate outside its validity window.
    pub fn validate_bootstrap_certificate(&self, cert: &CertificateData) -> Result<()> {
        let now = self.monitor.now();
        if now < cert.not_before() {
            return Err(CertError::validation(
                ValidationStage::Expiration,
                format!("bootstrap certificate not valid before {}", cert.not_before()),
            ));
        }
        if self.monitor.is_expired(cert)? {
            return Err(CertError::validation(
                ValidationStage::Expiration,
                format!("bootstrap certificate expired at {}", cert.not_after()),
            ));
        }
        Ok(())
    }

    /// Whether the bootstrap certificate loads, is in its window, and matches its key.
    pub async fn has_valid_bootstrap_certificate(&self) -> bool {
        match self.bootstrap_credential().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "bootstrap certificate unusable");
                false
            }
        }
    }

    async fn bootstrap_credential(&self) -> Result<TlsCredential> {
        let paths = self.bootstrap_paths()?;
        let cert = self.load_bootstrap_certificate().await?;
        self.validate_bootstrap_certificate(&cert)?;
        credential_from(paths, &cert).await
    }

    async fn management_credential(&self) -> Result<TlsCredential> {
        let pem = read(&self.management.cert_path, "load_certificate").await?;
        let cert = CertificateData::from_pem(&pem)?;
        if self.monitor.is_expired(&cert)? {
            return Err(CertError::validation(
                ValidationStage::Expiration,
                format!("management certificate expired at {}", cert.not_after()),
            ));
        }
        credential_from(&self.management, &cert).await
    }

    /// Management credential when it is still valid, otherwise the bootstrap one.
    pub async fn get_certificate_for_auth(&self) -> Result<AuthCredential> {
        match self.management_credential().await {
            Ok(tls) => {
                return Ok(AuthCredential {
                    method: AuthMethod::Management,
                    tls,
                })
            }
            Err(e) => warn!(error = %e, "management certificate unusable, trying bootstrap"),
        }

        match self.bootstrap_credential().await {
            Ok(tls) => Ok(AuthCredential {
                method: AuthMethod::Bootstrap,
                tls,
            }),
            Err(e) => {
                warn!(error = %e, "bootstrap certificate unusable");
                Err(CertError::NoAuthMethod)
            }
        }
    }
}

#[async_trait]
impl CredentialSource for BootstrapCertificateHandler {
    async fn has_valid_credential(&self) -> bool {
        self.has_valid_bootstrap_certificate().await
    }

    async fn credential_for_auth(&self) -> Result<AuthCredential> {
        self.get_certificate_for_auth().await
    }
}

async fn read(path: &Path, operation: &'static str) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| CertError::storage(operation, format!("{}: {}", path.display(), e)))
}

async fn credential_from(paths: &CertKeyPaths, cert: &CertificateData) -> Result<TlsCredential> {
    let key = zeroize::Zeroizing::new(read(&paths.key_path, "load_key").await?);
    if !cert.matches_private_key(&key)? {
        return Err(CertError::validation(
            ValidationStage::KeyPair,
            format!("{} does not match its key", paths.cert_path.display()),
        ));
    }
    TlsCredential::from_pem(cert.to_pem().as_bytes(), &key)
}
