#![warn(missing_docs)]

//! EdgeCert wire contract shared by the device agent and the signing service.
//!
//! The agent submits certificate signing requests and polls them until a
//! certificate is issued or the request reaches a terminal condition. Renewal
//! and recovery intent travel as a label on the request.

pub mod client;
pub mod csr;
pub mod error;
pub mod event;

pub use client::{ApiResponse, ClientCredential, ClientFactory, ManagementClient};
pub use csr::{
    CertificateSigningRequest, CertificateSigningRequestSpec, CertificateSigningRequestStatus,
    Condition, ConditionType, RenewalReason, RENEWAL_REASON_LABEL,
};
pub use error::{ApiError, ApiResult};
pub use event::{CertificateRenewalEvent, RenewalEventType};
