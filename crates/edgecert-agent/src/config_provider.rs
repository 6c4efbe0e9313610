//! Sources of certificate declarations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::CertificateConfig;
use crate::error::{CertError, Result};

/// Declares the certificates one part of the configuration manages.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Provider name, used as the first half of certificate keys.
    fn name(&self) -> &str;

    /// Current declarations.
    async fn certificates(&self) -> Result<Vec<CertificateConfig>>;
}

/// Fixed list of declarations.
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    name: String,
    certificates: Vec<CertificateConfig>,
}

impl StaticConfigProvider {
    /// Provider `name` declaring `certificates`.
    pub fn new(name: impl Into<String>, certificates: Vec<CertificateConfig>) -> Self {
        Self {
            name: name.into(),
            certificates,
        }
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn certificates(&self) -> Result<Vec<CertificateConfig>> {
        Ok(self.certificates.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct DropInFile {
    #[serde(default)]
    certificates: Vec<CertificateConfig>,
}

/// Declarations read from `*.toml` and `*.json` files in a directory.
///
/// The directory is re-read on every call, so removing a file removes its
/// certificates on the next sync. A missing directory declares nothing.
#[derive(Debug, Clone)]
pub struct DropInConfigProvider {
    name: String,
    dir: PathBuf,
}

impl DropInConfigProvider {
    /// Provider reading `dir`.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    async fn read_file(path: &Path) -> Result<Vec<CertificateConfig>> {
        let text = tokio::fs::read_to_string(path).await?;
        let parsed: DropInFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text).map_err(|e| CertError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
            _ => toml::from_str(&text).map_err(|e| CertError::Config {
                reason: format!("{}: {}", path.display(), e),
            })?,
        };
        Ok(parsed.certificates)
    }
}

#[async_trait]
impl ConfigProvider for DropInConfigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn certificates(&self) -> Result<Vec<CertificateConfig>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if matches!(path.extension().and_then(|e| e.to_str()), Some("toml" | "json")) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut certs = Vec::new();
        for path in paths {
            let declared = Self::read_file(&path).await?;
            debug!(path = %path.display(), count = declared.len(), "read drop-in certificates");
            certs.extend(declared);
        }
        Ok(certs)
    }
}
