#![warn(missing_docs)]

//! EdgeCert signing service.
//!
//! Issues device certificates from a [`SigningCa`], auto-approves proactive
//! renewals from devices holding a current certificate, and validates
//! recovery requests for expired certificates against a CA signature or TPM
//! attestation. Every renewal and recovery is recorded in an [`EventLog`].

pub mod ca;
pub mod client;
pub mod error;
pub mod events;
pub mod service;

pub use ca::{csr_common_name, IssuedPair, PeerCertificate, SigningCa};
pub use client::{InProcessClient, InProcessClientFactory};
pub use error::{Result, SignerError};
pub use events::EventLog;
pub use service::{AttestationVerifier, Clock, SigningService};
