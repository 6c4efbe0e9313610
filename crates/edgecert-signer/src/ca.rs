//! Signing CA: issues device certificates and checks presented ones.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    IsCa, KeyPair, KeyUsagePurpose,
};
use ::time::OffsetDateTime;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::*;

use crate::error::{Result, SignerError};

/// Default lifetime of issued certificates.
pub const DEFAULT_CERT_VALIDITY_DAYS: i64 = 365;

/// Default lifetime of a generated CA.
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// A certificate presented by a client, after its signature was checked
/// against the CA. Validity is reported, not enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Subject common name.
    pub common_name: String,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

impl PeerCertificate {
    /// Whether `at` lies within the validity window.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.not_before && at <= self.not_after
    }
}

/// A certificate and its freshly generated key.
#[derive(Debug, Clone)]
pub struct IssuedPair {
    /// PEM certificate.
    pub cert_pem: String,
    /// PEM private key.
    pub key_pem: String,
}

/// Certificate authority backing the signing service.
pub struct SigningCa {
    cert: rcgen::Certificate,
    key: KeyPair,
    cert_pem: String,
    validity: Duration,
}

impl std::fmt::Debug for SigningCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCa")
            .field("validity_days", &self.validity.num_days())
            .finish_non_exhaustive()
    }
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp()).map_err(SignerError::signing)
}

fn pem_contents(pem: &[u8], what: &str) -> Result<Vec<u8>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|e| SignerError::malformed(format!("{}: {}", what, e)))?;
    Ok(pem.contents)
}

fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| SignerError::malformed(format!("timestamp {} out of range", secs)))
}

impl SigningCa {
    /// Generates a new CA named `common_name`, valid from a day ago for ten years.
    pub fn generate(common_name: &str) -> Result<Self> {
        let key = KeyPair::generate().map_err(|e| SignerError::signing(format!("failed to generate CA key: {}", e)))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name);
        distinguished_name.push(DnType::OrganizationName, "EdgeCert");
        params.distinguished_name = distinguished_name;
        let now = Utc::now();
        params.not_before = to_offset(now - Duration::days(1))?;
        params.not_after = to_offset(now + Duration::days(CA_VALIDITY_DAYS))?;

        let cert = params
            .self_signed(&key)
            .map_err(|e| SignerError::signing(format!("failed to create CA certificate: {}", e)))?;
        let cert_pem = cert.pem();
        Ok(Self {
            cert,
            key,
            cert_pem,
            validity: Duration::days(DEFAULT_CERT_VALIDITY_DAYS),
        })
    }

    /// Loads an existing CA certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| SignerError::malformed(format!("CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| SignerError::malformed(format!("CA certificate: {}", e)))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| SignerError::signing(format!("failed to reconstruct CA certificate: {}", e)))?;
        Ok(Self {
            cert,
            key,
            cert_pem: cert_pem.to_string(),
            validity: Duration::days(DEFAULT_CERT_VALIDITY_DAYS),
        })
    }

    /// Sets the default lifetime of issued certificates.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Default lifetime of issued certificates.
    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// CA bundle in PEM, as distributed to devices.
    pub fn bundle_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Signs a PEM CSR for the window `[not_before, not_after]`.
    pub fn sign_csr(&self, csr_pem: &str, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Result<String> {
        let mut request = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| SignerError::malformed(format!("certificate request: {}", e)))?;
        request.params.is_ca = IsCa::NoCa;
        request.params.not_before = to_offset(not_before)?;
        request.params.not_after = to_offset(not_after)?;
        let cert = request.signed_by(&self.cert, &self.key).map_err(SignerError::signing)?;
        Ok(cert.pem())
    }

    /// Issues a certificate for `common_name` with a new key.
    pub fn issue(&self, common_name: &str, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Result<IssuedPair> {
        let key = KeyPair::generate().map_err(SignerError::signing)?;
        let cert_pem = self.issue_for_key(common_name, &key.serialize_pem(), not_before, not_after)?;
        Ok(IssuedPair {
            cert_pem,
            key_pem: key.serialize_pem(),
        })
    }

    /// Issues a certificate for `common_name` bound to an existing key.
    pub fn issue_for_key(
        &self,
        common_name: &str,
        key_pem: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<String> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| SignerError::malformed(format!("key: {}", e)))?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(SignerError::signing)?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(SignerError::signing)?;
        Ok(cert.pem())
    }

    /// Checks that `pem` carries a certificate signed by this CA.
    pub fn verify_peer(&self, pem: &[u8]) -> Result<PeerCertificate> {
        let der = pem_contents(pem, "peer certificate")?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| SignerError::malformed(format!("peer certificate: {}", e)))?;
        let (_, ca) = X509Certificate::from_der(self.cert.der())
            .map_err(|e| SignerError::signing(format!("CA certificate: {}", e)))?;
        cert.verify_signature(Some(ca.public_key()))
            .map_err(|e| SignerError::Forbidden {
                reason: format!("peer certificate not issued by this CA: {}", e),
            })?;

        let validity = cert.validity();
        Ok(PeerCertificate {
            common_name: common_name(cert.subject()).ok_or_else(|| SignerError::Forbidden {
                reason: "peer certificate has no common name".to_string(),
            })?,
            not_before: timestamp(validity.not_before.timestamp())?,
            not_after: timestamp(validity.not_after.timestamp())?,
        })
    }
}

/// Verifies a PEM CSR's self-signature and returns its common name.
pub fn csr_common_name(csr_pem: &str) -> Result<String> {
    let der = pem_contents(csr_pem.as_bytes(), "certificate request")?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| SignerError::malformed(format!("certificate request: {}", e)))?;
    csr.verify_signature()
        .map_err(|e| SignerError::malformed(format!("certificate request signature: {}", e)))?;
    common_name(&csr.certification_request_info.subject)
        .ok_or_else(|| SignerError::malformed("certificate request has no common name"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csr_for(cn: &str) -> (String, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let csr = params.serialize_request(&key).unwrap().pem().unwrap();
        (csr, key)
    }

    #[test]
    fn test_sign_csr_chains_to_ca() {
        let ca = SigningCa::generate("edge-ca").unwrap();
        let (csr, _) = csr_for("device-1");
        let now = Utc::now();
        let cert = ca.sign_csr(&csr, now, now + Duration::days(30)).unwrap();

        let peer = ca.verify_peer(cert.as_bytes()).unwrap();
        assert_eq!(peer.common_name, "device-1");
        assert!(peer.is_valid_at(now + Duration::days(1)));
        assert!(!peer.is_valid_at(now + Duration::days(31)));
    }

    #[test]
    fn test_foreign_certificate_rejected() {
        let ca = SigningCa::generate("edge-ca").unwrap();
        let other = SigningCa::generate("other-ca").unwrap();
        let now = Utc::now();
        let pair = other.issue("device-1", now, now + Duration::days(1)).unwrap();
        let err = ca.verify_peer(pair.cert_pem.as_bytes()).unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn test_expired_certificate_still_verifies() {
        let ca = SigningCa::generate("edge-ca").unwrap();
        let now = Utc::now();
        let pair = ca
            .issue("device-1", now - Duration::days(40), now - Duration::days(10))
            .unwrap();
        let peer = ca.verify_peer(pair.cert_pem.as_bytes()).unwrap();
        assert!(!peer.is_valid_at(now));
    }

    #[test]
    fn test_csr_common_name() {
        let (csr, _) = csr_for("device-9");
        assert_eq!(csr_common_name(&csr).unwrap(), "device-9");
        assert_eq!(csr_common_name("garbage").unwrap_err().status(), 400);
    }

    #[test]
    fn test_reload_from_pem_keeps_trust() {
        let ca = SigningCa::generate("edge-ca").unwrap();
        let reloaded = SigningCa::from_pem(ca.bundle_pem(), &ca.key.serialize_pem()).unwrap();
        let now = Utc::now();
        let pair = reloaded.issue("device-1", now, now + Duration::days(1)).unwrap();
        assert!(ca.verify_peer(pair.cert_pem.as_bytes()).is_ok());
    }
}
