//! Hardware-rooted attestation for certificate recovery.
//!
//! Used as the last authentication option when neither the management nor
//! the bootstrap certificate can be presented. Attestations are built fresh
//! for every attempt and never persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{CertError, Result};

/// Size of the single-use attestation nonce.
pub const NONCE_LEN: usize = 32;

/// PCRs quoted when none are configured.
pub const DEFAULT_PCR_SELECTION: [u32; 3] = [0, 1, 7];

/// Access to a trusted platform module.
pub trait TpmDevice: Send + Sync {
    /// Signed quote over `pcrs` bound to `nonce`.
    fn quote(&self, nonce: &[u8], pcrs: &[u32]) -> Result<Vec<u8>>;

    /// Current values of `pcrs`.
    fn read_pcrs(&self, pcrs: &[u32]) -> Result<BTreeMap<u32, Vec<u8>>>;

    /// Endorsement key public part, used for the device fingerprint.
    fn endorsement_public_key(&self) -> Result<Vec<u8>>;

    /// Local attestation key public part, if provisioned.
    fn attestation_public_key(&self) -> Option<Vec<u8>> {
        None
    }

    /// LDevID public key, if provisioned.
    fn ldevid_public_key(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Placeholder device for hosts without a TPM.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableTpm;

impl TpmDevice for UnavailableTpm {
    fn quote(&self, _nonce: &[u8], _pcrs: &[u32]) -> Result<Vec<u8>> {
        Err(CertError::Tpm("no TPM device available".to_string()))
    }

    fn read_pcrs(&self, _pcrs: &[u32]) -> Result<BTreeMap<u32, Vec<u8>>> {
        Err(CertError::Tpm("no TPM device available".to_string()))
    }

    fn endorsement_public_key(&self) -> Result<Vec<u8>> {
        Err(CertError::Tpm("no TPM device available".to_string()))
    }
}

/// Evidence sent with a recovery CSR.
#[derive(Clone, PartialEq, Eq)]
pub struct RenewalAttestation {
    /// TPM quote.
    pub quote: Vec<u8>,
    /// Quoted PCR values.
    pub pcr_values: BTreeMap<u32, Vec<u8>>,
    /// Hex SHA-256 of the endorsement key.
    pub device_fingerprint: String,
    /// Single-use nonce bound into the quote.
    pub nonce: [u8; NONCE_LEN],
    /// LAK public key.
    pub lak_public_key: Option<Vec<u8>>,
    /// LDevID public key.
    pub ldevid_public_key: Option<Vec<u8>>,
}

impl fmt::Debug for RenewalAttestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewalAttestation")
            .field("device_fingerprint", &self.device_fingerprint)
            .field("pcrs", &self.pcr_values.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct AttestationDocument<'a> {
    quote: String,
    pcr_values: BTreeMap<String, String>,
    device_fingerprint: &'a str,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lak_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ldevid_public_key: Option<String>,
}

impl RenewalAttestation {
    /// JSON document attached to the CSR. Binary fields are base64, PCR values hex.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let doc = AttestationDocument {
            quote: STANDARD.encode(&self.quote),
            pcr_values: self
                .pcr_values
                .iter()
                .map(|(pcr, value)| (pcr.to_string(), hex::encode(value)))
                .collect(),
            device_fingerprint: &self.device_fingerprint,
            nonce: STANDARD.encode(self.nonce),
            lak_public_key: self.lak_public_key.as_ref().map(|k| STANDARD.encode(k)),
            ldevid_public_key: self.ldevid_public_key.as_ref().map(|k| STANDARD.encode(k)),
        };
        serde_json::to_value(doc).map_err(|e| CertError::Tpm(format!("encoding attestation: {}", e)))
    }
}

/// Builds renewal attestations from a [`TpmDevice`].
#[derive(Clone)]
pub struct TpmRenewalProvider {
    device: Arc<dyn TpmDevice>,
    pcr_selection: Vec<u32>,
}

impl fmt::Debug for TpmRenewalProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TpmRenewalProvider")
            .field("pcr_selection", &self.pcr_selection)
            .finish_non_exhaustive()
    }
}

impl TpmRenewalProvider {
    /// Provider over `device`. An empty selection quotes [`DEFAULT_PCR_SELECTION`].
    pub fn new(device: Arc<dyn TpmDevice>, pcr_selection: Vec<u32>) -> Self {
        let pcr_selection = if pcr_selection.is_empty() {
            DEFAULT_PCR_SELECTION.to_vec()
        } else {
            pcr_selection
        };
        Self { device, pcr_selection }
    }

    /// PCRs included in quotes.
    pub fn pcr_selection(&self) -> &[u32] {
        &self.pcr_selection
    }

    /// Quotes the selected PCRs under a fresh nonce.
    pub fn generate_renewal_attestation(&self) -> Result<RenewalAttestation> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let quote = self.device.quote(&nonce, &self.pcr_selection)?;
        let pcr_values = self.device.read_pcrs(&self.pcr_selection)?;
        let ek = self.device.endorsement_public_key()?;
        let device_fingerprint = hex::encode(Sha256::digest(&ek));
        debug!(fingerprint = %device_fingerprint, pcrs = ?self.pcr_selection, "generated renewal attestation");

        Ok(RenewalAttestation {
            quote,
            pcr_values,
            device_fingerprint,
            nonce,
            lak_public_key: self.device.attestation_public_key(),
            ldevid_public_key: self.device.ldevid_public_key(),
        })
    }

    /// CSR signed by a TPM-resident key with the attestation embedded.
    pub fn generate_tpm_csr(&self, _common_name: &str, _attestation: &RenewalAttestation) -> Result<String> {
        Err(CertError::NotImplemented("TPM-based CSR generation"))
    }

    /// Private key for a TPM-issued certificate.
    pub fn device_key_pem(&self) -> Result<Zeroizing<Vec<u8>>> {
        Err(CertError::NotImplemented("TPM-resident key retrieval"))
    }
}
