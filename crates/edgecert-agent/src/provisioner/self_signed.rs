//! Self-signed certificates minted locally.

use std::sync::Arc;

use async_trait::async_trait;
use rcgen::{CertificateParams, DnType, KeyPair};
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::{IssuedCertificate, ProvisionResult, Provisioner};
use crate::config::CertificateConfig;
use crate::error::{CertError, Result};
use crate::registry::{ProvisionContext, ProvisionerFactory};
use crate::x509::CertificateData;

/// Type tag of the self-signed provisioner.
pub const SELF_SIGNED_PROVISIONER: &str = "self-signed";

const DEFAULT_VALIDITY_DAYS: u64 = 365;

/// Mints a self-signed certificate on every call.
#[derive(Debug, Clone)]
pub struct SelfSignedProvisioner {
    common_name: String,
    validity_days: u64,
}

impl SelfSignedProvisioner {
    /// Creates a provisioner for `common_name` valid for `validity_days`.
    pub fn new(common_name: impl Into<String>, validity_days: u64) -> Self {
        Self {
            common_name: common_name.into(),
            validity_days,
        }
    }

    fn mint(&self) -> Result<IssuedCertificate> {
        let key_pair = KeyPair::generate().map_err(provision_err)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(provision_err)?;
        params
            .distinguished_name
            .push(DnType::CommonName, self.common_name.as_str());
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(1);
        params.not_after = now + Duration::days(self.validity_days as i64);

        let cert = params.self_signed(&key_pair).map_err(provision_err)?;
        Ok(IssuedCertificate {
            cert: CertificateData::from_der(cert.der())?,
            key_pem: Zeroizing::new(key_pair.serialize_pem().into_bytes()),
        })
    }
}

fn provision_err(e: rcgen::Error) -> CertError {
    CertError::Provision {
        reason: format!("self-signed certificate: {}", e),
    }
}

#[async_trait]
impl Provisioner for SelfSignedProvisioner {
    fn kind(&self) -> &'static str {
        SELF_SIGNED_PROVISIONER
    }

    fn expected_common_name(&self) -> &str {
        &self.common_name
    }

    fn is_self_signed(&self) -> bool {
        true
    }

    async fn provision(&self, token: &CancellationToken) -> Result<ProvisionResult> {
        if token.is_cancelled() {
            return Err(CertError::Cancelled);
        }
        Ok(ProvisionResult::Ready(self.mint()?))
    }
}

/// Builds [`SelfSignedProvisioner`] from `{common_name, validity_days}`.
#[derive(Debug, Default)]
pub struct SelfSignedProvisionerFactory;

impl ProvisionerFactory for SelfSignedProvisionerFactory {
    fn kind(&self) -> &'static str {
        SELF_SIGNED_PROVISIONER
    }

    fn validate(&self, config: &CertificateConfig) -> Result<()> {
        let params = &config.provisioner;
        if let Some(value) = params.params.get("validity_days") {
            match value.as_u64() {
                Some(days) if days > 0 => {}
                _ => {
                    return Err(CertError::Config {
                        reason: format!(
                            "certificate {}: validity_days must be a positive integer",
                            config.name
                        ),
                    })
                }
            }
        }
        if let Some(value) = params.params.get("common_name") {
            if value.as_str().map_or(true, str::is_empty) {
                return Err(CertError::Config {
                    reason: format!("certificate {}: common_name must be a non-empty string", config.name),
                });
            }
        }
        Ok(())
    }

    fn build(&self, config: &CertificateConfig, ctx: &ProvisionContext) -> Result<Arc<dyn Provisioner>> {
        let common_name = config
            .provisioner
            .param_str("common_name")
            .unwrap_or_else(|| ctx.identity.device_name());
        let validity_days = config
            .provisioner
            .param_u64("validity_days")
            .unwrap_or(DEFAULT_VALIDITY_DAYS);
        Ok(Arc::new(SelfSignedProvisioner::new(common_name, validity_days)))
    }
}
