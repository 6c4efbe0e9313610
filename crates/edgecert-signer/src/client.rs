//! In-process management client backed by a [`SigningService`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use edgecert_api::{
    ApiError, ApiResponse, ApiResult, CertificateSigningRequest, ClientCredential, ClientFactory,
    ManagementClient,
};

use crate::error::SignerError;
use crate::service::SigningService;

/// Calls the service directly, presenting a fixed peer certificate.
#[derive(Debug, Clone)]
pub struct InProcessClient {
    service: Arc<SigningService>,
    peer: Option<Vec<u8>>,
    offline: Arc<AtomicBool>,
}

impl InProcessClient {
    /// Client presenting `peer` (PEM), or no certificate.
    pub fn new(service: Arc<SigningService>, peer: Option<Vec<u8>>) -> Self {
        Self {
            service,
            peer,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_online(&self) -> ApiResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Transport {
                reason: "signing service unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ManagementClient for InProcessClient {
    async fn create_certificate_signing_request(
        &self,
        csr: &CertificateSigningRequest,
    ) -> ApiResult<ApiResponse<CertificateSigningRequest>> {
        self.check_online()?;
        match self
            .service
            .create_certificate_signing_request(csr.clone(), self.peer.as_deref())
        {
            Ok(created) => Ok(ApiResponse::new(201, created)),
            Err(e) => Ok(ApiResponse::empty(e.status())),
        }
    }

    async fn get_certificate_signing_request(
        &self,
        name: &str,
    ) -> ApiResult<ApiResponse<CertificateSigningRequest>> {
        self.check_online()?;
        match self.service.get_certificate_signing_request(name) {
            Ok(csr) => Ok(ApiResponse::new(200, csr)),
            Err(SignerError::NotFound { name }) => Err(ApiError::NotFound { name }),
            Err(e) => Ok(ApiResponse::empty(e.status())),
        }
    }
}

/// Builds [`InProcessClient`]s whose peer certificate is the credential's.
#[derive(Debug, Clone)]
pub struct InProcessClientFactory {
    service: Arc<SigningService>,
    offline: Arc<AtomicBool>,
}

impl InProcessClientFactory {
    /// Factory over `service`.
    pub fn new(service: Arc<SigningService>) -> Self {
        Self {
            service,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every client fail with a transport error until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Underlying service.
    pub fn service(&self) -> &Arc<SigningService> {
        &self.service
    }
}

impl ClientFactory for InProcessClientFactory {
    fn client(&self, credential: Option<&ClientCredential>) -> ApiResult<Arc<dyn ManagementClient>> {
        Ok(Arc::new(InProcessClient {
            service: self.service.clone(),
            peer: credential.map(|c| c.cert_pem.clone()),
            offline: self.offline.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::SigningCa;
    use chrono::{Duration, Utc};
    use edgecert_api::RenewalReason;
    use rcgen::{CertificateParams, DnType, KeyPair};

    const SIGNER: &str = "edgecert.io/device-management";

    fn request(name: &str, cn: &str) -> CertificateSigningRequest {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let pem = params.serialize_request(&key).unwrap().pem().unwrap();
        CertificateSigningRequest::new(name, pem, SIGNER)
    }

    #[tokio::test]
    async fn test_credential_becomes_peer() {
        let service = Arc::new(SigningService::new(SigningCa::generate("edge-ca").unwrap(), SIGNER));
        let now = Utc::now();
        let current = service
            .ca()
            .issue("dev-1", now - Duration::days(1), now + Duration::days(5))
            .unwrap();
        let factory = InProcessClientFactory::new(service.clone());
        let client = factory
            .client(Some(&ClientCredential {
                cert_pem: current.cert_pem.into_bytes(),
                key_pem: current.key_pem.into_bytes(),
            }))
            .unwrap();

        let csr = request("dev-1-renew", "dev-1").with_renewal_reason(RenewalReason::Proactive);
        let created = client.create_certificate_signing_request(&csr).await.unwrap();
        assert_eq!(created.status, 201);
        assert!(created.body.unwrap().status.certificate.is_some());

        let fetched = client.get_certificate_signing_request("dev-1-renew").await.unwrap();
        assert_eq!(fetched.status, 200);
    }

    #[tokio::test]
    async fn test_errors_map_to_status() {
        let service = Arc::new(SigningService::new(SigningCa::generate("edge-ca").unwrap(), SIGNER));
        let factory = InProcessClientFactory::new(service);
        let client = factory.client(None).unwrap();

        let created = client
            .create_certificate_signing_request(&request("anon", "dev-1"))
            .await
            .unwrap();
        assert_eq!(created.status, 403);
        assert!(created.body.is_none());

        assert!(matches!(
            client.get_certificate_signing_request("anon").await,
            Err(ApiError::NotFound { .. })
        ));

        factory.set_offline(true);
        let err = client.get_certificate_signing_request("anon").await.unwrap_err();
        assert!(err.is_transient());
    }
}
