//! Client seams for talking to the management service.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::csr::CertificateSigningRequest;
use crate::error::ApiResult;

/// Status code plus optional body, as returned by the management service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse<T> {
    /// HTTP status code.
    pub status: u16,
    /// Decoded body, when the service returned one.
    pub body: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Creates a response with a body.
    pub fn new(status: u16, body: T) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    /// Creates a response without a body.
    pub fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    /// Whether the status is 200 or 201.
    pub fn is_created_or_ok(&self) -> bool {
        self.status == 200 || self.status == 201
    }
}

/// Certificate and key used to authenticate a client over mTLS.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredential {
    /// PEM-encoded certificate chain.
    pub cert_pem: Vec<u8>,
    /// PEM-encoded private key.
    pub key_pem: Vec<u8>,
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Signing-request endpoints of the management service.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Submits a new signing request.
    async fn create_certificate_signing_request(
        &self,
        csr: &CertificateSigningRequest,
    ) -> ApiResult<ApiResponse<CertificateSigningRequest>>;

    /// Fetches a signing request by name.
    async fn get_certificate_signing_request(
        &self,
        name: &str,
    ) -> ApiResult<ApiResponse<CertificateSigningRequest>>;
}

/// Builds management clients authenticated with a given credential.
///
/// `None` means no client certificate is presented, which is how a
/// hardware-attested recovery reaches the service.
pub trait ClientFactory: Send + Sync {
    /// Returns a client authenticating with `credential`.
    fn client(&self, credential: Option<&ClientCredential>) -> ApiResult<Arc<dyn ManagementClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_statuses() {
        assert!(ApiResponse::<()>::empty(200).is_created_or_ok());
        assert!(ApiResponse::<()>::empty(201).is_created_or_ok());
        assert!(!ApiResponse::<()>::empty(202).is_created_or_ok());
        assert!(!ApiResponse::<()>::empty(409).is_created_or_ok());
    }

    #[test]
    fn test_credential_debug_hides_key() {
        let cred = ClientCredential {
            cert_pem: b"cert".to_vec(),
            key_pem: b"super-secret".to_vec(),
        };
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("cert_pem_len"));
    }
}
