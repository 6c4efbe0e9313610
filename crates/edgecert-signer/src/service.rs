//! Signing-request intake: enrollment, proactive renewal and recovery.
//!
//! Renewal and recovery requests that fail validation are still stored,
//! carrying a `Denied` condition, so the device learns the outcome by
//! polling. Enrollment without a usable client certificate is refused
//! outright and nothing is stored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use edgecert_api::{
    CertificateRenewalEvent, CertificateSigningRequest, Condition, ConditionType, RenewalEventType,
    RenewalReason, RENEWAL_REASON_LABEL,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::ca::{csr_common_name, PeerCertificate, SigningCa};
use crate::error::{Result, SignerError};
use crate::events::EventLog;

/// Longest lifetime a request may ask for.
pub const MAX_EXPIRATION_SECS: u64 = 100 * 365 * 86400;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Judges TPM attestation attached to a recovery request.
pub trait AttestationVerifier: Send + Sync {
    /// Accepts or rejects `attestation` for `device_name`, with a reason on rejection.
    fn verify(&self, device_name: &str, attestation: &serde_json::Value) -> std::result::Result<(), String>;
}

/// In-process signing service.
pub struct SigningService {
    ca: SigningCa,
    signer_name: String,
    auto_approve_enrollment: bool,
    auto_approve_renewal: bool,
    devices: RwLock<HashSet<String>>,
    requests: RwLock<HashMap<String, CertificateSigningRequest>>,
    events: EventLog,
    verifier: Option<Arc<dyn AttestationVerifier>>,
    clock: Clock,
}

impl std::fmt::Debug for SigningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningService")
            .field("signer_name", &self.signer_name)
            .field("devices", &self.devices.read().len())
            .field("requests", &self.requests.read().len())
            .finish_non_exhaustive()
    }
}

impl SigningService {
    /// Service issuing from `ca` for requests naming `signer_name`.
    pub fn new(ca: SigningCa, signer_name: impl Into<String>) -> Self {
        Self {
            ca,
            signer_name: signer_name.into(),
            auto_approve_enrollment: false,
            auto_approve_renewal: true,
            devices: RwLock::new(HashSet::new()),
            requests: RwLock::new(HashMap::new()),
            events: EventLog::new(),
            verifier: None,
            clock: Arc::new(Utc::now),
        }
    }

    /// Signs enrollment requests without manual approval.
    pub fn with_auto_approve_enrollment(mut self, enabled: bool) -> Self {
        self.auto_approve_enrollment = enabled;
        self
    }

    /// Signs proactive renewals from a valid client certificate without
    /// manual approval. On by default.
    pub fn with_auto_approve_renewal(mut self, enabled: bool) -> Self {
        self.auto_approve_renewal = enabled;
        self
    }

    /// Accepts TPM-attested recovery requests judged by `verifier`.
    pub fn with_attestation_verifier(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Signing CA.
    pub fn ca(&self) -> &SigningCa {
        &self.ca
    }

    /// Audit log.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Adds a device to the fleet.
    pub fn register_device(&self, device_name: impl Into<String>) {
        self.devices.write().insert(device_name.into());
    }

    /// Whether the device is part of the fleet.
    pub fn is_registered(&self, device_name: &str) -> bool {
        self.devices.read().contains(device_name)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn event(&self, device: &str, event_type: RenewalEventType, reason: RenewalReason) -> CertificateRenewalEvent {
        let mut event = CertificateRenewalEvent::new(device, event_type, reason.as_str());
        event.created_at = self.now();
        event
    }

    /// Accepts a signing request presented with the caller's certificate, if any.
    pub fn create_certificate_signing_request(
        &self,
        mut csr: CertificateSigningRequest,
        peer: Option<&[u8]>,
    ) -> Result<CertificateSigningRequest> {
        if self.requests.read().contains_key(&csr.name) {
            return Err(SignerError::AlreadyExists { name: csr.name });
        }
        if csr.spec.signer_name != self.signer_name {
            return Err(SignerError::malformed(format!("unknown signer {}", csr.spec.signer_name)));
        }
        let common_name = csr_common_name(&csr.spec.request)?;
        let reason = match csr.labels.get(RENEWAL_REASON_LABEL) {
            Some(value) => Some(
                value
                    .parse::<RenewalReason>()
                    .map_err(|_| SignerError::malformed(format!("invalid {} label '{}'", RENEWAL_REASON_LABEL, value)))?,
            ),
            None => None,
        };
        csr.status = Default::default();

        match reason {
            Some(RenewalReason::Proactive) => self.handle_renewal(&mut csr, &common_name, peer),
            Some(RenewalReason::Expired) => self.handle_recovery(&mut csr, &common_name, peer),
            None => self.handle_enrollment(&mut csr, &common_name, peer)?,
        }

        let mut requests = self.requests.write();
        if requests.contains_key(&csr.name) {
            return Err(SignerError::AlreadyExists { name: csr.name });
        }
        requests.insert(csr.name.clone(), csr.clone());
        Ok(csr)
    }

    /// Current state of a stored request.
    pub fn get_certificate_signing_request(&self, name: &str) -> Result<CertificateSigningRequest> {
        self.requests
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SignerError::NotFound { name: name.to_string() })
    }

    /// Manually approves and signs a pending request.
    pub fn approve(&self, name: &str) -> Result<CertificateSigningRequest> {
        let mut csr = self.get_certificate_signing_request(name)?;
        if csr.status.certificate.is_some() || csr.is_terminal_failure() {
            return Ok(csr);
        }
        let common_name = csr_common_name(&csr.spec.request)?;
        let not_after = self.sign(&mut csr, "ManuallyApproved")?;
        if csr.labels.get(RENEWAL_REASON_LABEL).map(String::as_str) == Some(RenewalReason::Proactive.as_str()) {
            let mut event = self.event(&common_name, RenewalEventType::RenewalSuccess, RenewalReason::Proactive);
            event.new_expiration = Some(not_after);
            self.events.record(event);
        }
        self.register_device(common_name);
        self.requests.write().insert(csr.name.clone(), csr.clone());
        Ok(csr)
    }

    /// Names of requests that are neither issued nor rejected, sorted.
    pub fn pending_requests(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .requests
            .read()
            .values()
            .filter(|csr| csr.status.certificate.is_none() && !csr.is_terminal_failure())
            .map(|csr| csr.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Manually denies a pending request.
    pub fn deny(&self, name: &str, message: &str) -> Result<CertificateSigningRequest> {
        let mut csr = self.get_certificate_signing_request(name)?;
        if csr.status.certificate.is_none() {
            csr.set_condition(Condition::new(ConditionType::Denied, "ManuallyDenied", message));
            self.requests.write().insert(csr.name.clone(), csr.clone());
        }
        Ok(csr)
    }

    /// Signs `csr` in place. Returns the new certificate's expiry.
    fn sign(&self, csr: &mut CertificateSigningRequest, reason: &str) -> Result<DateTime<Utc>> {
        let not_before = self.now();
        let validity = match csr.spec.expiration_seconds {
            Some(secs) => Duration::seconds(secs.min(MAX_EXPIRATION_SECS) as i64),
            None => self.ca.validity(),
        };
        let not_after = not_before + validity;
        match self.ca.sign_csr(&csr.spec.request, not_before, not_after) {
            Ok(cert) => {
                csr.status.certificate = Some(cert);
                csr.set_condition(Condition::new(ConditionType::Approved, reason, "certificate issued"));
                Ok(not_after)
            }
            Err(e) => {
                csr.set_condition(Condition::new(ConditionType::Failed, "SigningFailed", e.to_string()));
                Err(e)
            }
        }
    }

    fn deny_with(&self, csr: &mut CertificateSigningRequest, reason: &str, error: &SignerError) {
        warn!(request = %csr.name, reason, error = %error, "certificate signing request denied");
        csr.set_condition(Condition::new(ConditionType::Denied, reason, error.to_string()));
    }

    fn current_peer(&self, peer: Option<&[u8]>, common_name: &str) -> Result<PeerCertificate> {
        let pem = peer.ok_or_else(|| SignerError::Forbidden {
            reason: "renewal requires a client certificate".to_string(),
        })?;
        let peer = self.ca.verify_peer(pem)?;
        if !peer.is_valid_at(self.now()) {
            return Err(SignerError::Forbidden {
                reason: "client certificate is not currently valid".to_string(),
            });
        }
        if peer.common_name != common_name {
            return Err(SignerError::Forbidden {
                reason: format!(
                    "client certificate CN {} does not match request CN {}",
                    peer.common_name, common_name
                ),
            });
        }
        Ok(peer)
    }

    fn handle_renewal(&self, csr: &mut CertificateSigningRequest, common_name: &str, peer: Option<&[u8]>) {
        let reason = RenewalReason::Proactive;
        self.events
            .record(self.event(common_name, RenewalEventType::RenewalStart, reason));

        let mut outcome = self.event(common_name, RenewalEventType::RenewalSuccess, reason);
        let result = self.current_peer(peer, common_name).and_then(|peer| {
            outcome.old_expiration = Some(peer.not_after);
            if !self.auto_approve_renewal {
                return Ok(None);
            }
            self.sign(csr, "RenewalAutoApproved").map(Some)
        });
        match result {
            Ok(Some(not_after)) => {
                info!(request = %csr.name, device = common_name, "renewal approved");
                outcome.new_expiration = Some(not_after);
            }
            Ok(None) => {
                debug!(request = %csr.name, device = common_name, "renewal awaiting approval");
                return;
            }
            Err(e) => {
                if !csr.is_terminal_failure() {
                    self.deny_with(csr, "RenewalRejected", &e);
                }
                outcome.event_type = RenewalEventType::RenewalFailed;
                outcome.error_message = Some(e.to_string());
            }
        }
        self.events.record(outcome);
    }

    /// Recovery trusts a CA signature on an expired certificate, or TPM attestation.
    fn recovery_identity(
        &self,
        csr: &CertificateSigningRequest,
        common_name: &str,
        peer: Option<&[u8]>,
    ) -> Result<Option<DateTime<Utc>>> {
        if !self.is_registered(common_name) {
            return Err(SignerError::Forbidden {
                reason: format!("device {} is not enrolled", common_name),
            });
        }

        let by_peer = peer.map(|pem| {
            let peer = self.ca.verify_peer(pem)?;
            if peer.common_name != common_name {
                return Err(SignerError::Forbidden {
                    reason: format!(
                        "client certificate CN {} does not match request CN {}",
                        peer.common_name, common_name
                    ),
                });
            }
            Ok(peer.not_after)
        });
        if let Some(Ok(not_after)) = by_peer {
            return Ok(Some(not_after));
        }

        match (&self.verifier, &csr.spec.attestation) {
            (Some(verifier), Some(attestation)) => {
                verifier
                    .verify(common_name, attestation)
                    .map_err(|reason| SignerError::Forbidden {
                        reason: format!("attestation rejected: {}", reason),
                    })?;
                debug!(device = common_name, "recovery accepted on attestation");
                Ok(None)
            }
            _ => match by_peer {
                Some(Err(e)) => Err(e),
                _ => Err(SignerError::Forbidden {
                    reason: "recovery requires a CA-signed client certificate or verified attestation".to_string(),
                }),
            },
        }
    }

    fn handle_recovery(&self, csr: &mut CertificateSigningRequest, common_name: &str, peer: Option<&[u8]>) {
        let reason = RenewalReason::Expired;
        self.events
            .record(self.event(common_name, RenewalEventType::RecoveryStart, reason));

        let mut outcome = self.event(common_name, RenewalEventType::RecoverySuccess, reason);
        let result = self.recovery_identity(csr, common_name, peer).and_then(|old| {
            outcome.old_expiration = old;
            self.sign(csr, "RecoveryApproved")
        });
        match result {
            Ok(not_after) => {
                info!(request = %csr.name, device = common_name, "recovery approved");
                outcome.new_expiration = Some(not_after);
            }
            Err(e) => {
                if !csr.is_terminal_failure() {
                    self.deny_with(csr, "RecoveryRejected", &e);
                }
                outcome.event_type = RenewalEventType::RecoveryFailed;
                outcome.error_message = Some(e.to_string());
            }
        }
        self.events.record(outcome);
    }

    fn handle_enrollment(&self, csr: &mut CertificateSigningRequest, common_name: &str, peer: Option<&[u8]>) -> Result<()> {
        let pem = peer.ok_or_else(|| SignerError::Forbidden {
            reason: "enrollment requires a client certificate".to_string(),
        })?;
        let peer = self.ca.verify_peer(pem)?;
        if !peer.is_valid_at(self.now()) {
            return Err(SignerError::Forbidden {
                reason: "client certificate is not currently valid".to_string(),
            });
        }
        if self.auto_approve_enrollment {
            self.sign(csr, "EnrollmentAutoApproved")?;
            self.register_device(common_name);
            info!(request = %csr.name, device = common_name, "enrollment approved");
        } else {
            debug!(request = %csr.name, device = common_name, "enrollment awaiting approval");
        }
        Ok(())
    }
}
