//! Certificate provisioners.
//!
//! A provisioner either hands back a certificate and key immediately or
//! reports that a request was submitted and is awaiting approval, in which
//! case the caller requeues and calls again later.

pub mod csr;
pub mod self_signed;

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::error::Result;
use crate::x509::CertificateData;

pub use csr::{CsrProvisioner, CsrProvisionerFactory, CSR_PROVISIONER};
pub use self_signed::{SelfSignedProvisioner, SelfSignedProvisionerFactory, SELF_SIGNED_PROVISIONER};

/// A certificate with its private key.
pub struct IssuedCertificate {
    /// Parsed certificate.
    pub cert: CertificateData,
    /// PEM private key.
    pub key_pem: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert", &self.cert)
            .finish_non_exhaustive()
    }
}

/// Outcome of one provisioning call.
#[derive(Debug)]
pub enum ProvisionResult {
    /// Submitted but not yet issued; call again after the requeue delay.
    Pending,
    /// Certificate available.
    Ready(IssuedCertificate),
}

/// Obtains certificates for one managed certificate.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Registered type tag.
    fn kind(&self) -> &'static str;

    /// Common name issued certificates must carry.
    fn expected_common_name(&self) -> &str;

    /// Whether issued certificates are self-signed rather than CA-issued.
    fn is_self_signed(&self) -> bool {
        false
    }

    /// Provisions or checks on a previous submission.
    async fn provision(&self, token: &CancellationToken) -> Result<ProvisionResult>;
}
