//! Device identity: the long-lived device key and the name derived from it.

use std::path::Path;

use rcgen::{CertificateParams, DnType, KeyPair};
use sha2::{Digest, Sha256};
use tracing::info;
use zeroize::Zeroizing;

use crate::error::{CertError, Result};

/// Length of a device name in hex characters.
pub const DEVICE_NAME_LEN: usize = 32;

/// Device key holder able to sign certificate requests.
pub trait IdentityProvider: Send + Sync {
    /// Device name used as certificate common name.
    fn device_name(&self) -> &str;

    /// Device private key as PKCS#8 PEM.
    fn key_pem(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// PEM CSR for `common_name`, signed with the device key.
    fn create_csr(&self, common_name: &str) -> Result<String>;
}

/// Derives a device name from a raw public key.
pub fn device_name_for(public_key: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(public_key));
    digest[..DEVICE_NAME_LEN].to_string()
}

/// Builds a PEM CSR with the given common name.
pub fn csr_for_key(key_pair: &KeyPair, common_name: &str) -> Result<String> {
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| CertError::Provision {
        reason: format!("invalid CSR parameters: {}", e),
    })?;
    params.distinguished_name.push(DnType::CommonName, common_name);
    let csr = params.serialize_request(key_pair).map_err(|e| CertError::Provision {
        reason: format!("failed to create CSR: {}", e),
    })?;
    csr.pem().map_err(|e| CertError::Provision {
        reason: format!("failed to encode CSR: {}", e),
    })
}

/// Identity backed by an ECDSA P-256 key file, created on first use.
pub struct FileIdentityProvider {
    key_pair: KeyPair,
    key_pem: Zeroizing<String>,
    device_name: String,
}

impl std::fmt::Debug for FileIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIdentityProvider")
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

impl FileIdentityProvider {
    /// Loads the key at `path`, generating and persisting one if absent.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let pem = match tokio::fs::read_to_string(path).await {
            Ok(pem) => Zeroizing::new(pem),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key_pair = KeyPair::generate().map_err(|e| CertError::Provision {
                    reason: format!("failed to generate device key: {}", e),
                })?;
                let pem = Zeroizing::new(key_pair.serialize_pem());
                write_key(path, pem.as_bytes()).await?;
                info!(path = %path.display(), "generated device key");
                pem
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_pem(pem)
    }

    /// Wraps an existing PEM key.
    pub fn from_pem(pem: Zeroizing<String>) -> Result<Self> {
        let key_pair = KeyPair::from_pem(&pem).map_err(|e| CertError::Parse {
            what: "device key",
            reason: e.to_string(),
        })?;
        let device_name = device_name_for(key_pair.public_key_raw());
        Ok(Self {
            key_pair,
            key_pem: pem,
            device_name,
        })
    }

    /// Raw device public key.
    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key_raw()
    }
}

impl IdentityProvider for FileIdentityProvider {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn key_pem(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(self.key_pem.as_bytes().to_vec()))
    }

    fn create_csr(&self, common_name: &str) -> Result<String> {
        csr_for_key(&self.key_pair, common_name)
    }
}

async fn write_key(path: &Path, pem: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, pem).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
