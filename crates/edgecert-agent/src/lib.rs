#![warn(missing_docs)]

//! EdgeCert device agent: mTLS certificate provisioning, renewal, atomic
//! swap and recovery of expired certificates.
//!
//! [`CertManager`] reconciles declared certificates and drains the
//! processing queue. [`LifecycleManager`] tracks per-certificate state and
//! recovers expired certificates using a bootstrap certificate or TPM
//! attestation. [`CertificateValidator`] guards every replacement of an
//! active certificate.

pub mod backoff;
pub mod bootstrap;
pub mod certificate;
pub mod cli;
pub mod client;
pub mod config;
pub mod config_provider;
pub mod error;
pub mod expiration;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod provisioner;
pub mod queue;
pub mod registry;
pub mod status;
pub mod storage;
pub mod tls;
pub mod tpm;
pub mod validator;
pub mod x509;

pub use backoff::BackoffPolicy;
pub use bootstrap::{AuthCredential, AuthMethod, BootstrapCertificateHandler, CredentialSource};
pub use certificate::{certificate_key, Certificate, CertificateInfo};
pub use client::{HttpClientFactory, HttpManagementClient};
pub use config::{AgentConfig, CertKeyPaths, CertificateConfig, TpmConfig, TypedConfig};
pub use config_provider::{ConfigProvider, DropInConfigProvider, StaticConfigProvider};
pub use error::{CertError, Result, ResultExt, ValidationStage};
pub use expiration::{Clock, ExpirationMonitor};
pub use identity::{FileIdentityProvider, IdentityProvider};
pub use lifecycle::{
    CertificateLifecycleState, CertificateState, LifecycleManager, LifecycleStateStore,
    RecoveryAuthMethod, SweepReport,
};
pub use logging::{init_tracing, LogFormat, OperationTimer};
pub use manager::{CertManager, CertManagerBuilder, ManagerSettings, SyncReport};
pub use metrics::{CertificateMetrics, Outcome};
pub use provisioner::{IssuedCertificate, ProvisionResult, Provisioner};
pub use queue::{EnqueueOutcome, ProcessingQueue, QueueItem};
pub use registry::{FactoryRegistry, ProvisionContext};
pub use status::CertificateStatus;
pub use storage::{FilesystemStorage, StorageProvider, SwapFailure};
pub use tls::TlsCredential;
pub use tpm::{RenewalAttestation, TpmDevice, TpmRenewalProvider, UnavailableTpm};
pub use validator::{CertificateValidator, SwapRecovery, ValidationTarget};
pub use x509::CertificateData;
