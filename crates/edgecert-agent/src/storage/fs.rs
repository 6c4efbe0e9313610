//! Filesystem storage for a PEM certificate/key pair.
//!
//! Pending files live at `<path>.pending` and backups at `<path>.backup`.
//! Writes go to `<path>.tmp` and are renamed into place, so a reader never
//! sees a half-written file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use super::{StorageProvider, SwapFailure};
use crate::config::{CertKeyPaths, CertificateConfig};
use crate::error::{CertError, Result, ResultExt};
use crate::registry::StorageFactory;
use crate::x509::CertificateData;

/// Type tag of the filesystem storage provider.
pub const FILESYSTEM_STORAGE: &str = "filesystem";

const KEY_MODE: u32 = 0o600;
const CERT_MODE: u32 = 0o644;

/// Stores a certificate and key as PEM files.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl FilesystemStorage {
    /// Creates storage for the given file pair.
    pub fn new(paths: &CertKeyPaths) -> Self {
        Self {
            cert_path: paths.cert_path.clone(),
            key_path: paths.key_path.clone(),
        }
    }

    /// Active certificate path.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Active key path.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Pending certificate path.
    pub fn pending_cert_path(&self) -> PathBuf {
        with_suffix(&self.cert_path, "pending")
    }

    /// Pending key path.
    pub fn pending_key_path(&self) -> PathBuf {
        with_suffix(&self.key_path, "pending")
    }

    /// Backup certificate path.
    pub fn backup_cert_path(&self) -> PathBuf {
        with_suffix(&self.cert_path, "backup")
    }

    /// Backup key path.
    pub fn backup_key_path(&self) -> PathBuf {
        with_suffix(&self.key_path, "backup")
    }

    async fn write_pair(&self, cert_path: &Path, key_path: &Path, cert: &CertificateData, key_pem: &[u8]) -> Result<()> {
        write_atomic(key_path, key_pem, KEY_MODE).await?;
        write_atomic(cert_path, cert.to_pem().as_bytes(), CERT_MODE).await
    }

    /// Copies the active pair to the backup paths. A partial backup is
    /// removed so that a later restore never sees a mixed pair.
    async fn write_backup(&self) -> Result<()> {
        let copied = async {
            copy_atomic(&self.cert_path, &self.backup_cert_path(), CERT_MODE).await?;
            copy_atomic(&self.key_path, &self.backup_key_path(), KEY_MODE).await
        }
        .await;
        if let Err(e) = copied {
            for path in [self.backup_cert_path(), self.backup_key_path()] {
                if let Err(cleanup) = remove_if_exists(&path).await {
                    warn!(path = %path.display(), error = %cleanup, "failed to remove partial backup");
                }
            }
            return Err(e.context("backing up active certificate"));
        }
        Ok(())
    }

    async fn restore_from_backup(&self) -> Result<()> {
        copy_atomic(&self.backup_key_path(), &self.key_path, KEY_MODE)
            .await
            .context("restoring backup key")?;
        copy_atomic(&self.backup_cert_path(), &self.cert_path, CERT_MODE)
            .await
            .context("restoring backup certificate")
    }
}

#[async_trait]
impl StorageProvider for FilesystemStorage {
    fn kind(&self) -> &'static str {
        FILESYSTEM_STORAGE
    }

    async fn load_certificate(&self) -> Result<CertificateData> {
        load_cert(&self.cert_path, "load_certificate").await
    }

    async fn load_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        load_key(&self.key_path, "load_key").await
    }

    async fn write(&self, cert: &CertificateData, key_pem: &[u8]) -> Result<()> {
        self.write_pair(&self.cert_path, &self.key_path, cert, key_pem).await?;
        debug!(path = %self.cert_path.display(), "wrote active certificate");
        Ok(())
    }

    async fn write_pending(&self, cert: &CertificateData, key_pem: &[u8]) -> Result<()> {
        let cert_path = self.pending_cert_path();
        let key_path = self.pending_key_path();
        self.write_pair(&cert_path, &key_path, cert, key_pem).await?;
        debug!(path = %cert_path.display(), "wrote pending certificate");
        Ok(())
    }

    async fn load_pending_certificate(&self) -> Result<CertificateData> {
        load_cert(&self.pending_cert_path(), "load_pending_certificate").await
    }

    async fn load_pending_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        load_key(&self.pending_key_path(), "load_pending_key").await
    }

    async fn has_pending_certificate(&self) -> Result<bool> {
        tokio::fs::try_exists(self.pending_cert_path())
            .await
            .map_err(|e| CertError::storage("has_pending_certificate", e))
    }

    async fn cleanup_pending(&self) -> Result<()> {
        remove_if_exists(&self.pending_cert_path()).await?;
        remove_if_exists(&self.pending_key_path()).await
    }

    async fn atomic_swap(&self) -> std::result::Result<(), SwapFailure> {
        let pending_cert = self.pending_cert_path();
        let pending_key = self.pending_key_path();
        for path in [&pending_cert, &pending_key] {
            if !exists(path).await? {
                return Err(SwapFailure::untouched(CertError::storage(
                    "atomic_swap",
                    format!("missing pending file {}", path.display()),
                )));
            }
        }

        let has_active = exists(&self.cert_path).await? && exists(&self.key_path).await?;
        if has_active {
            self.write_backup().await?;
        }

        tokio::fs::rename(&pending_key, &self.key_path)
            .await
            .map_err(|e| SwapFailure::untouched(CertError::storage("atomic_swap", e)))?;

        if let Err(e) = tokio::fs::rename(&pending_cert, &self.cert_path).await {
            warn!(path = %self.cert_path.display(), error = %e, "certificate rename failed, restoring key");
            let restored = if has_active {
                self.restore_from_backup().await
            } else {
                remove_if_exists(&self.key_path).await
            };
            if let Err(restore) = &restored {
                error!(path = %self.key_path.display(), error = %restore, "failed to restore key after swap failure");
            }
            return Err(SwapFailure {
                active_modified: restored.is_err(),
                error: CertError::storage("atomic_swap", e),
            });
        }
        Ok(())
    }

    async fn rollback_swap(&self) -> Result<()> {
        self.restore_backup().await?;
        self.cleanup_pending().await
    }

    async fn restore_backup(&self) -> Result<bool> {
        if !exists(&self.backup_cert_path()).await? || !exists(&self.backup_key_path()).await? {
            return Ok(false);
        }
        self.restore_from_backup().await?;
        Ok(true)
    }

    async fn delete(&self) -> Result<()> {
        for path in [
            self.cert_path.clone(),
            self.key_path.clone(),
            self.pending_cert_path(),
            self.pending_key_path(),
            self.backup_cert_path(),
            self.backup_key_path(),
        ] {
            remove_if_exists(&path).await?;
        }
        Ok(())
    }
}

/// Builds [`FilesystemStorage`] from `{cert_path, key_path}` parameters.
#[derive(Debug, Default)]
pub struct FilesystemStorageFactory;

impl StorageFactory for FilesystemStorageFactory {
    fn kind(&self) -> &'static str {
        FILESYSTEM_STORAGE
    }

    fn validate(&self, config: &CertificateConfig) -> Result<()> {
        paths_from(config).map(|_| ())
    }

    fn build(&self, config: &CertificateConfig) -> Result<Arc<dyn StorageProvider>> {
        Ok(Arc::new(FilesystemStorage::new(&paths_from(config)?)))
    }
}

fn paths_from(config: &CertificateConfig) -> Result<CertKeyPaths> {
    let cert_path = config.storage.require_str("cert_path")?;
    let key_path = config.storage.require_str("key_path")?;
    if cert_path == key_path {
        return Err(CertError::Config {
            reason: format!("certificate {}: cert_path and key_path must differ", config.name),
        });
    }
    Ok(CertKeyPaths {
        cert_path: PathBuf::from(cert_path),
        key_path: PathBuf::from(key_path),
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| CertError::storage("stat", e))
}

async fn load_cert(path: &Path, operation: &'static str) -> Result<CertificateData> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| CertError::storage(operation, format!("{}: {}", path.display(), e)))?;
    CertificateData::from_pem(&pem)
}

async fn load_key(path: &Path, operation: &'static str) -> Result<Zeroizing<Vec<u8>>> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| CertError::storage(operation, format!("{}: {}", path.display(), e)))?;
    Ok(Zeroizing::new(pem))
}

async fn copy_atomic(from: &Path, to: &Path, mode: u32) -> Result<()> {
    let contents = Zeroizing::new(
        tokio::fs::read(from)
            .await
            .map_err(|e| CertError::storage("copy", format!("{}: {}", from.display(), e)))?,
    );
    write_atomic(to, &contents, mode).await
}

async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CertError::storage("write", e))?;
    }
    let tmp_path = with_suffix(path, "tmp");

    {
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| CertError::storage("write", e))?;
        set_mode(&file, mode).await?;
        file.write_all(contents)
            .await
            .map_err(|e| CertError::storage("write", e))?;
        file.sync_all()
            .await
            .map_err(|e| CertError::storage("write", e))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| CertError::storage("write", e))
}

#[cfg(unix)]
async fn set_mode(file: &tokio::fs::File, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| CertError::storage("write", e))
}

#[cfg(not(unix))]
async fn set_mode(_file: &tokio::fs::File, _mode: u32) -> Result<()> {
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CertError::storage("remove", e)),
    }
}
