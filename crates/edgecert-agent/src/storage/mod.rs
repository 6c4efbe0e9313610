//! Certificate storage providers.
//!
//! A provider owns one active certificate/key pair plus the pending pair
//! used during renewal and the backup kept by the last swap. Cleanup and
//! delete must be safe to call repeatedly.

pub mod fs;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::{CertError, Result};
use crate::x509::CertificateData;

pub use fs::{FilesystemStorage, FilesystemStorageFactory};

/// A failed [`StorageProvider::atomic_swap`].
#[derive(Debug)]
pub struct SwapFailure {
    /// The active pair may differ from what it was before the swap.
    pub active_modified: bool,
    /// Underlying error.
    pub error: CertError,
}

impl SwapFailure {
    /// Failure before any active file was touched.
    pub fn untouched(error: CertError) -> Self {
        Self {
            active_modified: false,
            error,
        }
    }
}

impl From<CertError> for SwapFailure {
    fn from(error: CertError) -> Self {
        Self::untouched(error)
    }
}

impl From<SwapFailure> for CertError {
    fn from(failure: SwapFailure) -> Self {
        failure.error
    }
}

/// Persistence contract for one managed certificate.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Registered type tag.
    fn kind(&self) -> &'static str;

    /// Loads the active certificate.
    async fn load_certificate(&self) -> Result<CertificateData>;

    /// Loads the active private key as PEM.
    async fn load_key(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// Replaces the active certificate and key.
    async fn write(&self, cert: &CertificateData, key_pem: &[u8]) -> Result<()>;

    /// Stores a certificate and key next to the active pair without touching it.
    async fn write_pending(&self, cert: &CertificateData, key_pem: &[u8]) -> Result<()>;

    /// Loads the pending certificate.
    async fn load_pending_certificate(&self) -> Result<CertificateData>;

    /// Loads the pending private key as PEM.
    async fn load_pending_key(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// Whether a pending certificate exists.
    async fn has_pending_certificate(&self) -> Result<bool>;

    /// Removes pending files. Missing files are not an error.
    async fn cleanup_pending(&self) -> Result<()>;

    /// Promotes the pending pair to active, keeping the old pair as backup.
    ///
    /// On failure the active pair is left as it was unless
    /// [`SwapFailure::active_modified`] is set.
    async fn atomic_swap(&self) -> std::result::Result<(), SwapFailure>;

    /// Restores the backup pair when one exists and removes pending files.
    async fn rollback_swap(&self) -> Result<()>;

    /// Restores the backup pair. Returns `false` when there is no backup.
    async fn restore_backup(&self) -> Result<bool>;

    /// Removes active, pending and backup files. Missing files are not an error.
    async fn delete(&self) -> Result<()>;
}
