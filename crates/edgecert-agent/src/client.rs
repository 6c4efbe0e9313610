//! HTTPS management client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgecert_api::{
    ApiError, ApiResponse, ApiResult, CertificateSigningRequest, ClientCredential, ClientFactory,
    ManagementClient,
};
use reqwest::StatusCode;
use tracing::debug;

const CSR_PATH: &str = "api/v1/certificatesigningrequests";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn transport(e: reqwest::Error) -> ApiError {
    ApiError::Transport {
        reason: e.to_string(),
    }
}

/// Talks to the management service over mTLS.
#[derive(Debug, Clone)]
pub struct HttpManagementClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpManagementClient {
    /// Client for `server_url` trusting `ca_pem`, presenting `credential` when given.
    pub fn new(server_url: &str, ca_pem: &[u8], credential: Option<&ClientCredential>) -> ApiResult<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT);

        if !ca_pem.is_empty() {
            let roots = reqwest::Certificate::from_pem_bundle(ca_pem).map_err(|e| ApiError::InvalidCredential {
                reason: format!("CA bundle: {}", e),
            })?;
            for root in roots {
                builder = builder.add_root_certificate(root);
            }
        }

        if let Some(credential) = credential {
            let mut pem = credential.cert_pem.clone();
            pem.push(b'\n');
            pem.extend_from_slice(&credential.key_pem);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| ApiError::InvalidCredential {
                reason: e.to_string(),
            })?;
            builder = builder.identity(identity);
        }

        Ok(Self {
            http: builder.build().map_err(transport)?,
            base_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{}/{}/{}", self.base_url, CSR_PATH, name),
            None => format!("{}/{}", self.base_url, CSR_PATH),
        }
    }

    async fn decode(response: reqwest::Response) -> ApiResult<ApiResponse<CertificateSigningRequest>> {
        let status = response.status();
        if status.is_success() {
            let body = response.json::<CertificateSigningRequest>().await.map_err(transport)?;
            return Ok(ApiResponse::new(status.as_u16(), body));
        }
        Ok(ApiResponse::empty(status.as_u16()))
    }
}

#[async_trait]
impl ManagementClient for HttpManagementClient {
    async fn create_certificate_signing_request(
        &self,
        csr: &CertificateSigningRequest,
    ) -> ApiResult<ApiResponse<CertificateSigningRequest>> {
        debug!(request = %csr.name, "creating certificate signing request");
        let response = self
            .http
            .post(self.url(None))
            .json(csr)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response).await
    }

    async fn get_certificate_signing_request(
        &self,
        name: &str,
    ) -> ApiResult<ApiResponse<CertificateSigningRequest>> {
        let response = self
            .http
            .get(self.url(Some(name)))
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                name: name.to_string(),
            });
        }
        Self::decode(response).await
    }
}

/// Builds [`HttpManagementClient`]s for one server.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    server_url: String,
    ca_pem: Vec<u8>,
}

impl HttpClientFactory {
    /// Factory for `server_url` trusting `ca_pem`. An empty bundle uses the built-in roots.
    pub fn new(server_url: impl Into<String>, ca_pem: Vec<u8>) -> Self {
        Self {
            server_url: server_url.into(),
            ca_pem,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn client(&self, credential: Option<&ClientCredential>) -> ApiResult<Arc<dyn ManagementClient>> {
        Ok(Arc::new(HttpManagementClient::new(
            &self.server_url,
            &self.ca_pem,
            credential,
        )?))
    }
}
