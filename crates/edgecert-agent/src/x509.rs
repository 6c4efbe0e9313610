//! Owned view of a parsed X.509 certificate.
//!
//! Certificates are parsed once with `x509-parser` and the fields the
//! lifecycle engine needs are copied out, so the value can be cached and
//! shared across tasks without borrowing the DER buffer.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::CertificateDer;
use x509_parser::prelude::*;

use crate::error::{CertError, Result};

/// Fields of an X.509 certificate used by the lifecycle engine.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateData {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    common_name: Option<String>,
    serial: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_key: Vec<u8>,
    is_ca: bool,
}

impl fmt::Debug for CertificateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateData")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl CertificateData {
    /// Parses a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| CertError::Parse {
            what: "certificate",
            reason: e.to_string(),
        })?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let validity = cert.validity();
        let not_before = timestamp_to_utc(validity.not_before.timestamp())?;
        let not_after = timestamp_to_utc(validity.not_after.timestamp())?;

        Ok(Self {
            der: der.to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            common_name,
            serial: cert.raw_serial_as_string(),
            not_before,
            not_after,
            public_key: cert.public_key().subject_public_key.data.to_vec(),
            is_ca: cert.is_ca(),
        })
    }

    /// Parses the first certificate in a PEM buffer.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut all = Self::all_from_pem(pem)?;
        Ok(all.remove(0))
    }

    /// Parses every certificate in a PEM buffer, failing if there are none.
    pub fn all_from_pem(pem: &[u8]) -> Result<Vec<Self>> {
        let ders = crate::tls::load_certs_from_pem(pem)?;
        ders.iter().map(|d| Self::from_der(d.as_ref())).collect()
    }

    /// DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// DER encoding as a rustls certificate.
    pub fn to_certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.der.clone())
    }

    /// PEM encoding.
    pub fn to_pem(&self) -> String {
        encode_pem("CERTIFICATE", &self.der)
    }

    /// RFC 4514 subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// RFC 4514 issuer.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Subject common name, if present.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Serial number as colon-separated hex.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Start of the validity window (UTC).
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window (UTC).
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Raw subject public key bits.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Whether the basic-constraints extension marks this as a CA.
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Whether `at` lies within the validity window, bounds inclusive.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.not_before && at <= self.not_after
    }

    /// Verifies that `issuer` signed this certificate. Validity is not checked.
    pub fn verify_signed_by(&self, issuer: &CertificateData) -> Result<()> {
        let (_, cert) = X509Certificate::from_der(&self.der).map_err(|e| CertError::Parse {
            what: "certificate",
            reason: e.to_string(),
        })?;
        let (_, issuer_cert) =
            X509Certificate::from_der(&issuer.der).map_err(|e| CertError::Parse {
                what: "issuer certificate",
                reason: e.to_string(),
            })?;
        cert.verify_signature(Some(issuer_cert.public_key()))
            .map_err(|e| CertError::Parse {
                what: "signature",
                reason: e.to_string(),
            })
    }

    /// Finds a CA in `roots` that signed this certificate.
    pub fn find_issuer<'a>(&self, roots: &'a [CertificateData]) -> Option<&'a CertificateData> {
        roots
            .iter()
            .filter(|root| root.subject == self.issuer)
            .find(|root| self.verify_signed_by(root).is_ok())
    }

    /// Whether the private key in `key_pem` belongs to this certificate.
    pub fn matches_private_key(&self, key_pem: &[u8]) -> Result<bool> {
        let pem = std::str::from_utf8(key_pem).map_err(|e| CertError::Parse {
            what: "private key",
            reason: e.to_string(),
        })?;
        let key_pair = rcgen::KeyPair::from_pem(pem).map_err(|e| CertError::Parse {
            what: "private key",
            reason: e.to_string(),
        })?;
        Ok(key_pair.public_key_raw() == self.public_key.as_slice())
    }
}

fn timestamp_to_utc(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| CertError::Parse {
            what: "validity",
            reason: format!("timestamp {} out of range", secs),
        })
}

/// Encodes DER bytes as a PEM block with the given label.
pub fn encode_pem(label: &str, der: &[u8]) -> String {
    let b64 = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for line in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Certificate fixtures shared by unit tests.

    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use time::{Duration, OffsetDateTime};

    /// A test CA.
    pub struct TestCa {
        pub cert: rcgen::Certificate,
        pub key: KeyPair,
    }

    impl TestCa {
        pub fn new(name: &str) -> Self {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.distinguished_name.push(DnType::CommonName, name);
            params.not_before = OffsetDateTime::now_utc() - Duration::days(365);
            params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);
            let cert = params.self_signed(&key).unwrap();
            Self { cert, key }
        }

        pub fn pem(&self) -> String {
            self.cert.pem()
        }

        /// Issues a leaf for `cn` valid from `start_days` to `end_days` relative to now.
        pub fn issue(&self, cn: &str, start_days: i64, end_days: i64) -> (String, String) {
            let key = KeyPair::generate().unwrap();
            let pem = self.issue_for_key(cn, &key, start_days, end_days);
            (pem, key.serialize_pem())
        }

        pub fn issue_for_key(&self, cn: &str, key: &KeyPair, start_days: i64, end_days: i64) -> String {
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.distinguished_name.push(DnType::CommonName, cn);
            let now = OffsetDateTime::now_utc();
            params.not_before = now + Duration::days(start_days);
            params.not_after = now + Duration::days(end_days);
            params
                .signed_by(key, &self.cert, &self.key)
                .unwrap()
                .pem()
        }

        /// Issues a leaf whose validity ends `offset` from now.
        pub fn issue_expiring_in(&self, cn: &str, offset: Duration) -> (String, String) {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.distinguished_name.push(DnType::CommonName, cn);
            let now = OffsetDateTime::now_utc();
            params.not_before = now - Duration::days(400);
            params.not_after = now + offset;
            let pem = params
                .signed_by(&key, &self.cert, &self.key)
                .unwrap()
                .pem();
            (pem, key.serialize_pem())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::TestCa;
    use super::*;

    #[test]
    fn test_parse_fields() {
        let ca = TestCa::new("Fleet CA");
        let (pem, _) = ca.issue("device-abc", -1, 30);
        let cert = CertificateData::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(cert.common_name(), Some("device-abc"));
        assert!(cert.issuer().contains("Fleet CA"));
        assert!(!cert.is_ca());
        assert!(cert.not_after() > cert.not_before());
        assert!(cert.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_pem_reencode_is_stable() {
        let ca = TestCa::new("Fleet CA");
        let (pem, _) = ca.issue("device-abc", -1, 30);
        let cert = CertificateData::from_pem(pem.as_bytes()).unwrap();
        let again = CertificateData::from_pem(cert.to_pem().as_bytes()).unwrap();
        assert_eq!(cert, again);
    }

    #[test]
    fn test_empty_pem_rejected() {
        assert!(CertificateData::from_pem(b"not a certificate").is_err());
    }

    #[test]
    fn test_signature_against_issuer() {
        let ca = TestCa::new("Fleet CA");
        let other = TestCa::new("Other CA");
        let (pem, _) = ca.issue("device-abc", -1, 30);
        let cert = CertificateData::from_pem(pem.as_bytes()).unwrap();
        let ca_cert = CertificateData::from_pem(ca.pem().as_bytes()).unwrap();
        let other_cert = CertificateData::from_pem(other.pem().as_bytes()).unwrap();

        assert!(cert.verify_signed_by(&ca_cert).is_ok());
        assert!(cert.verify_signed_by(&other_cert).is_err());
        assert!(cert.find_issuer(&[other_cert.clone(), ca_cert]).is_some());
        assert!(cert.find_issuer(&[other_cert]).is_none());
    }

    #[test]
    fn test_private_key_match() {
        let ca = TestCa::new("Fleet CA");
        let (pem, key) = ca.issue("device-abc", -1, 30);
        let (_, other_key) = ca.issue("device-xyz", -1, 30);
        let cert = CertificateData::from_pem(pem.as_bytes()).unwrap();
        assert!(cert.matches_private_key(key.as_bytes()).unwrap());
        assert!(!cert.matches_private_key(other_key.as_bytes()).unwrap());
        assert!(cert.matches_private_key(b"garbage").is_err());
    }
}
