//! mTLS credential handling for the device agent.
//!
//! A [`TlsCredential`] is the certificate chain and private key the agent
//! presents to the management service. Building one proves the key is usable
//! by the TLS stack, which is also how pending certificates are checked
//! before they are promoted.

use std::fmt;
use std::sync::Arc;

use edgecert_api::ClientCredential;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use zeroize::Zeroizing;

use crate::error::{CertError, Result};
use crate::x509::CertificateData;

/// Certificate chain plus private key, ready for a TLS client.
pub struct TlsCredential {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    cert_pem: Vec<u8>,
    key_pem: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for TlsCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCredential")
            .field("chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

impl Clone for TlsCredential {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.clone(),
        }
    }
}

impl TlsCredential {
    /// Builds a credential from PEM, rejecting keys the TLS stack cannot sign with.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        install_crypto_provider();
        let cert_chain = load_certs_from_pem(cert_pem)?;
        let key = load_private_key_from_pem(key_pem)?;

        rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| CertError::Tls {
            reason: format!("unsupported private key: {}", e),
        })?;

        Ok(Self {
            cert_chain,
            key,
            cert_pem: cert_pem.to_vec(),
            key_pem: Zeroizing::new(key_pem.to_vec()),
        })
    }

    /// Certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Private key.
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Parsed leaf certificate.
    pub fn leaf(&self) -> Result<CertificateData> {
        let first = self.cert_chain.first().ok_or_else(|| CertError::Tls {
            reason: "empty certificate chain".to_string(),
        })?;
        CertificateData::from_der(first.as_ref())
    }

    /// PEM form for management clients.
    pub fn to_client_credential(&self) -> ClientCredential {
        ClientCredential {
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.to_vec(),
        }
    }

    /// rustls client configuration presenting this credential and trusting `ca_pem`.
    pub fn client_config(&self, ca_pem: &[u8]) -> Result<Arc<rustls::ClientConfig>> {
        install_crypto_provider();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in load_certs_from_pem(ca_pem)? {
            root_store.add(cert).map_err(|e| CertError::Tls {
                reason: format!("failed to add CA cert: {}", e),
            })?;
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| CertError::Tls {
                reason: format!("failed to create client config: {}", e),
            })?;
        Ok(Arc::new(config))
    }
}

/// Installs the ring provider as the process default; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse {
            what: "certificate PEM",
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(CertError::Parse {
            what: "certificate PEM",
            reason: "no certificates found in PEM".to_string(),
        });
    }

    Ok(certs)
}

/// Loads a private key from PEM-encoded data (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| CertError::Parse {
            what: "private key PEM",
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::Parse {
            what: "private key PEM",
            reason: "no private key found in PEM".to_string(),
        })
}
