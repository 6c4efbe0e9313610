//! Certificates issued by the management service through a signing request.
//!
//! The first call generates a key and submits a CSR; later calls poll the
//! request until it carries a certificate or a terminal condition. The
//! submission lives in the provisioner handle, so discarding the handle
//! after an error starts over with a fresh key.

use std::sync::Arc;

use async_trait::async_trait;
use edgecert_api::{
    ApiError, CertificateSigningRequest, ConditionType, ManagementClient, RenewalReason,
};
use parking_lot::Mutex;
use rcgen::KeyPair;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{IssuedCertificate, ProvisionResult, Provisioner};
use crate::config::CertificateConfig;
use crate::error::{CertError, Result};
use crate::identity::csr_for_key;
use crate::registry::{ProvisionContext, ProvisionerFactory};
use crate::x509::CertificateData;

/// Type tag of the CSR provisioner.
pub const CSR_PROVISIONER: &str = "csr";

#[derive(Clone)]
struct Submission {
    name: String,
    key_pem: Zeroizing<String>,
}

/// Submits a CSR and polls for the issued certificate.
pub struct CsrProvisioner {
    certificate_name: String,
    common_name: String,
    signer_name: String,
    expiration_seconds: Option<u64>,
    renewal_reason: Option<RenewalReason>,
    client: Option<Arc<dyn ManagementClient>>,
    submission: Mutex<Option<Submission>>,
}

impl std::fmt::Debug for CsrProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrProvisioner")
            .field("certificate_name", &self.certificate_name)
            .field("common_name", &self.common_name)
            .field("signer_name", &self.signer_name)
            .field("submitted", &self.submission.lock().as_ref().map(|s| s.name.clone()))
            .finish_non_exhaustive()
    }
}

impl CsrProvisioner {
    fn client(&self) -> Result<&Arc<dyn ManagementClient>> {
        self.client.as_ref().ok_or_else(|| CertError::Provision {
            reason: "no authenticated management client available".to_string(),
        })
    }

    /// Name of the outstanding request, if any.
    pub fn submitted_request(&self) -> Option<String> {
        self.submission.lock().as_ref().map(|s| s.name.clone())
    }

    async fn submit(&self) -> Result<ProvisionResult> {
        let key_pair = KeyPair::generate().map_err(|e| CertError::Provision {
            reason: format!("failed to generate key: {}", e),
        })?;
        let request_pem = csr_for_key(&key_pair, &self.common_name)?;
        let name = format!(
            "{}-{}",
            self.certificate_name,
            hex::encode(rand::random::<[u8; 4]>())
        );

        let mut csr = CertificateSigningRequest::new(&name, request_pem, &self.signer_name);
        csr.spec.expiration_seconds = self.expiration_seconds;
        if let Some(reason) = self.renewal_reason {
            csr = csr.with_renewal_reason(reason);
        }

        let response = self.client()?.create_certificate_signing_request(&csr).await?;
        if !response.is_created_or_ok() {
            return Err(ApiError::UnexpectedStatus {
                status: response.status,
                message: format!("creating certificate signing request {}", name),
            }
            .into());
        }
        info!(request = %name, certificate = %self.certificate_name, "submitted certificate signing request");

        let submission = Submission {
            name,
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
        };
        *self.submission.lock() = Some(submission.clone());

        match response.body {
            Some(created) => self.evaluate(&submission, &created),
            None => Ok(ProvisionResult::Pending),
        }
    }

    async fn poll(&self, submission: &Submission) -> Result<ProvisionResult> {
        let response = match self
            .client()?
            .get_certificate_signing_request(&submission.name)
            .await
        {
            Ok(response) => response,
            Err(e @ ApiError::NotFound { .. }) => {
                self.submission.lock().take();
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let body = match (response.is_created_or_ok(), response.body) {
            (true, Some(body)) => body,
            _ => {
                return Err(ApiError::UnexpectedStatus {
                    status: response.status,
                    message: format!("fetching certificate signing request {}", submission.name),
                }
                .into())
            }
        };
        self.evaluate(submission, &body)
    }

    fn evaluate(&self, submission: &Submission, csr: &CertificateSigningRequest) -> Result<ProvisionResult> {
        if let Some(issued) = issued_certificate(csr, submission.key_pem.as_bytes())? {
            self.submission.lock().take();
            return Ok(ProvisionResult::Ready(issued));
        }
        if let Err(e) = terminal_condition(csr) {
            self.submission.lock().take();
            return Err(e);
        }
        debug!(request = %submission.name, "certificate signing request still pending");
        Ok(ProvisionResult::Pending)
    }
}

/// Certificate carried by `csr`, paired with `key_pem`, once issued.
pub fn issued_certificate(csr: &CertificateSigningRequest, key_pem: &[u8]) -> Result<Option<IssuedCertificate>> {
    let pem = match &csr.status.certificate {
        Some(pem) => pem,
        None => return Ok(None),
    };
    let cert = CertificateData::from_pem(pem.as_bytes())?;
    Ok(Some(IssuedCertificate {
        cert,
        key_pem: Zeroizing::new(key_pem.to_vec()),
    }))
}

/// Fails when `csr` carries a `Denied` or `Failed` condition.
pub fn terminal_condition(csr: &CertificateSigningRequest) -> Result<()> {
    for (condition_type, label) in [(ConditionType::Denied, "denied"), (ConditionType::Failed, "failed")] {
        if csr.has_condition(condition_type) {
            let message = csr
                .condition(condition_type)
                .map(|c| c.message.clone())
                .unwrap_or_default();
            return Err(CertError::SigningRejected {
                name: csr.name.clone(),
                condition: label,
                message,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl Provisioner for CsrProvisioner {
    fn kind(&self) -> &'static str {
        CSR_PROVISIONER
    }

    fn expected_common_name(&self) -> &str {
        &self.common_name
    }

    async fn provision(&self, token: &CancellationToken) -> Result<ProvisionResult> {
        if token.is_cancelled() {
            return Err(CertError::Cancelled);
        }
        let outstanding = self.submission.lock().clone();
        match outstanding {
            Some(submission) => self.poll(&submission).await,
            None => self.submit().await,
        }
    }
}

/// Builds [`CsrProvisioner`] from `{signer_name, common_name, expiration_seconds}`.
#[derive(Debug, Default)]
pub struct CsrProvisionerFactory;

impl ProvisionerFactory for CsrProvisionerFactory {
    fn kind(&self) -> &'static str {
        CSR_PROVISIONER
    }

    fn validate(&self, config: &CertificateConfig) -> Result<()> {
        let params = &config.provisioner.params;
        for key in ["signer_name", "common_name"] {
            if let Some(value) = params.get(key) {
                if value.as_str().map_or(true, str::is_empty) {
                    return Err(CertError::Config {
                        reason: format!("certificate {}: {} must be a non-empty string", config.name, key),
                    });
                }
            }
        }
        if let Some(value) = params.get("expiration_seconds") {
            if value.as_u64().map_or(true, |secs| secs == 0) {
                return Err(CertError::Config {
                    reason: format!(
                        "certificate {}: expiration_seconds must be a positive integer",
                        config.name
                    ),
                });
            }
        }
        Ok(())
    }

    fn build(&self, config: &CertificateConfig, ctx: &ProvisionContext) -> Result<Arc<dyn Provisioner>> {
        let params = &config.provisioner;
        Ok(Arc::new(CsrProvisioner {
            certificate_name: config.name.clone(),
            common_name: params
                .param_str("common_name")
                .unwrap_or_else(|| ctx.identity.device_name())
                .to_string(),
            signer_name: params
                .param_str("signer_name")
                .unwrap_or(ctx.default_signer.as_str())
                .to_string(),
            expiration_seconds: params.param_u64("expiration_seconds"),
            renewal_reason: ctx.renewing.then_some(RenewalReason::Proactive),
            client: ctx.client.clone(),
            submission: Mutex::new(None),
        }))
    }
}
