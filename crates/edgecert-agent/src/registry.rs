//! Provisioner and storage factories keyed by type tag.
//!
//! Construction is two explicit steps: `validate` checks a certificate
//! declaration without side effects, `build` creates the handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use edgecert_api::ManagementClient;

use crate::config::CertificateConfig;
use crate::error::{CertError, Result};
use crate::identity::IdentityProvider;
use crate::provisioner::{CsrProvisionerFactory, Provisioner, SelfSignedProvisionerFactory};
use crate::storage::{FilesystemStorageFactory, StorageProvider};

/// Inputs a provisioner may need when it is built.
#[derive(Clone)]
pub struct ProvisionContext {
    /// Device identity.
    pub identity: Arc<dyn IdentityProvider>,
    /// Authenticated management client, when one could be built.
    pub client: Option<Arc<dyn ManagementClient>>,
    /// Whether an active certificate is being replaced.
    pub renewing: bool,
    /// Signer used when the declaration names none.
    pub default_signer: String,
}

impl fmt::Debug for ProvisionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionContext")
            .field("device", &self.identity.device_name())
            .field("has_client", &self.client.is_some())
            .field("renewing", &self.renewing)
            .finish()
    }
}

/// Builds provisioners of one type.
pub trait ProvisionerFactory: Send + Sync {
    /// Type tag.
    fn kind(&self) -> &'static str;

    /// Checks the declaration's provisioner parameters.
    fn validate(&self, config: &CertificateConfig) -> Result<()>;

    /// Creates a provisioner for the declaration.
    fn build(&self, config: &CertificateConfig, ctx: &ProvisionContext) -> Result<Arc<dyn Provisioner>>;
}

/// Builds storage providers of one type.
pub trait StorageFactory: Send + Sync {
    /// Type tag.
    fn kind(&self) -> &'static str;

    /// Checks the declaration's storage parameters.
    fn validate(&self, config: &CertificateConfig) -> Result<()>;

    /// Creates a storage provider for the declaration.
    fn build(&self, config: &CertificateConfig) -> Result<Arc<dyn StorageProvider>>;
}

/// Registered factories.
#[derive(Default)]
pub struct FactoryRegistry {
    provisioners: HashMap<&'static str, Arc<dyn ProvisionerFactory>>,
    storages: HashMap<&'static str, Arc<dyn StorageFactory>>,
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut provisioners: Vec<_> = self.provisioners.keys().collect();
        let mut storages: Vec<_> = self.storages.keys().collect();
        provisioners.sort();
        storages.sort();
        f.debug_struct("FactoryRegistry")
            .field("provisioners", &provisioners)
            .field("storages", &storages)
            .finish()
    }
}

impl FactoryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `self-signed`, `csr` and `filesystem` types.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register_provisioner(Arc::new(SelfSignedProvisionerFactory))?;
        registry.register_provisioner(Arc::new(CsrProvisionerFactory))?;
        registry.register_storage(Arc::new(FilesystemStorageFactory))?;
        Ok(registry)
    }

    /// Adds a provisioner factory. A second factory for the same tag is rejected.
    pub fn register_provisioner(&mut self, factory: Arc<dyn ProvisionerFactory>) -> Result<()> {
        let kind = factory.kind();
        if self.provisioners.contains_key(kind) {
            return Err(CertError::Config {
                reason: format!("duplicate provisioner type: {}", kind),
            });
        }
        self.provisioners.insert(kind, factory);
        Ok(())
    }

    /// Adds a storage factory. A second factory for the same tag is rejected.
    pub fn register_storage(&mut self, factory: Arc<dyn StorageFactory>) -> Result<()> {
        let kind = factory.kind();
        if self.storages.contains_key(kind) {
            return Err(CertError::Config {
                reason: format!("duplicate storage type: {}", kind),
            });
        }
        self.storages.insert(kind, factory);
        Ok(())
    }

    fn provisioner_factory(&self, kind: &str) -> Result<&Arc<dyn ProvisionerFactory>> {
        self.provisioners.get(kind).ok_or_else(|| CertError::Config {
            reason: format!("unknown provisioner type: {}", kind),
        })
    }

    fn storage_factory(&self, kind: &str) -> Result<&Arc<dyn StorageFactory>> {
        self.storages.get(kind).ok_or_else(|| CertError::Config {
            reason: format!("unknown storage type: {}", kind),
        })
    }

    /// Validates both halves of a declaration.
    pub fn validate(&self, config: &CertificateConfig) -> Result<()> {
        self.provisioner_factory(&config.provisioner.kind)?
            .validate(config)?;
        self.storage_factory(&config.storage.kind)?.validate(config)
    }

    /// Validates and builds a provisioner.
    pub fn build_provisioner(&self, config: &CertificateConfig, ctx: &ProvisionContext) -> Result<Arc<dyn Provisioner>> {
        let factory = self.provisioner_factory(&config.provisioner.kind)?;
        factory.validate(config)?;
        factory.build(config, ctx)
    }

    /// Validates and builds a storage provider.
    pub fn build_storage(&self, config: &CertificateConfig) -> Result<Arc<dyn StorageProvider>> {
        let factory = self.storage_factory(&config.storage.kind)?;
        factory.validate(config)?;
        factory.build(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypedConfig;

    fn declaration(provisioner: &str, storage: &str) -> CertificateConfig {
        CertificateConfig {
            name: "web".to_string(),
            provisioner: TypedConfig::new(provisioner, serde_json::json!({ "common_name": "web" })),
            storage: TypedConfig::new(
                storage,
                serde_json::json!({ "cert_path": "/tmp/web.crt", "key_path": "/tmp/web.key" }),
            ),
        }
    }

    #[test]
    fn test_defaults_registered() {
        let registry = FactoryRegistry::with_defaults().unwrap();
        assert!(registry.validate(&declaration("self-signed", "filesystem")).is_ok());
        assert!(registry.validate(&declaration("csr", "filesystem")).is_ok());
        assert!(registry.build_storage(&declaration("csr", "filesystem")).is_ok());
    }

    #[test]
    fn test_unknown_types_rejected() {
        let registry = FactoryRegistry::with_defaults().unwrap();
        let err = registry.validate(&declaration("acme", "filesystem")).unwrap_err();
        assert!(err.to_string().contains("unknown provisioner type: acme"));
        let err = registry.validate(&declaration("csr", "vault")).unwrap_err();
        assert!(err.to_string().contains("unknown storage type: vault"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = FactoryRegistry::with_defaults().unwrap();
        let err = registry
            .register_storage(Arc::new(FilesystemStorageFactory))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate storage type"));
        let err = registry
            .register_provisioner(Arc::new(CsrProvisionerFactory))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate provisioner type"));
    }
}
