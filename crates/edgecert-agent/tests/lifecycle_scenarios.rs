//! Renewal-window, expiry, validation and credential-selection scenarios
//! against a real certificate directory and signing CA.

mod common;

use chrono::{Duration, Utc};
use common::{paths, Device};
use edgecert_agent::{
    AuthMethod, BootstrapCertificateHandler, CertificateData, CertificateState, CertificateValidator,
    FilesystemStorage, IssuedCertificate, StorageProvider, ValidationStage, ValidationTarget,
};
use edgecert_signer::SigningCa;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

#[tokio::test]
async fn test_expiring_certificate_enters_renewal_window() {
    let device = Device::new().await;
    let name = device.device_name();
    device.install("management", &name, -300, 25);
    let manager = device.manager();

    manager.inspect().await.unwrap();
    let cert = manager.certificate("static", "management").unwrap();
    let check = manager.lifecycle().check_renewal(&cert, 30).await.unwrap();

    assert!(check.needs_renewal);
    assert!((24..=25).contains(&check.days_until_expiration));
    let state = manager.lifecycle().get_state("static", "management");
    assert_eq!(state.state, CertificateState::ExpiringSoon);
    assert!(manager.queue().is_empty());
}

#[tokio::test]
async fn test_expired_certificate_detected_and_recovered() {
    let device = Device::new().await;
    let name = device.device_name();
    device.install("management", &name, -40, -10);
    device.install_bootstrap();
    device.service.register_device(&name);
    let manager = device.manager();

    manager.inspect().await.unwrap();
    let cert = manager.certificate("static", "management").unwrap();
    let expiry = manager.lifecycle().detect_expired_certificate(&cert).await.unwrap();
    assert!(expiry.expired);
    assert!((-10..=-9).contains(&expiry.days_until_expiration));

    let token = CancellationToken::new();
    let report = manager
        .lifecycle()
        .check_expired_certificates(&token, &[cert.clone()])
        .await
        .unwrap();
    assert_eq!(report.expired, vec!["static/management".to_string()]);
    assert_eq!(report.recovered, vec!["static/management".to_string()]);
    assert_eq!(
        manager.lifecycle().get_state("static", "management").state,
        CertificateState::Normal
    );
}

#[tokio::test]
async fn test_pending_from_foreign_ca_rejected_at_signature() {
    let device = Device::new().await;
    let name = device.device_name();
    let active = device.install("management", &name, -10, 20);

    let foreign = SigningCa::generate("Rogue CA").unwrap();
    let now = Utc::now();
    let pair = foreign
        .issue(&name, now - Duration::days(1), now + Duration::days(365))
        .unwrap();
    let issued = IssuedCertificate {
        cert: CertificateData::from_pem(pair.cert_pem.as_bytes()).unwrap(),
        key_pem: Zeroizing::new(pair.key_pem.into_bytes()),
    };

    let validator = CertificateValidator::new(device.path("ca.crt"), name.as_str());
    let storage = FilesystemStorage::new(&paths(device.dir.path(), "management"));
    let target = ValidationTarget {
        provider: "static",
        certificate: "management",
        common_name: &name,
        self_signed: false,
    };
    let err = validator.install_pending(&target, &storage, &issued).await.unwrap_err();

    assert!(err.to_string().contains("signature verification failed"));
    assert_eq!(err.validation_stage(), Some(ValidationStage::Signature));
    assert!(!storage.has_pending_certificate().await.unwrap());
    assert!(!storage.pending_key_path().exists());
    assert_eq!(std::fs::read_to_string(device.path("management.crt")).unwrap(), active);
}

#[tokio::test]
async fn test_wrong_identity_rejected_at_identity_stage() {
    let device = Device::new().await;
    let name = device.device_name();
    let now = Utc::now();
    let pair = device
        .service
        .ca()
        .issue("someone-else", now - Duration::days(1), now + Duration::days(365))
        .unwrap();
    let cert = CertificateData::from_pem(pair.cert_pem.as_bytes()).unwrap();

    let validator = CertificateValidator::new(device.path("ca.crt"), name.as_str());
    let err = validator
        .validate_pending_certificate(&cert, pair.key_pem.as_bytes())
        .await
        .unwrap_err();
    assert_eq!(err.validation_stage(), Some(ValidationStage::Identity));
}

#[tokio::test]
async fn test_expired_management_authenticates_with_bootstrap() {
    let device = Device::new().await;
    let name = device.device_name();
    device.install("management", &name, -40, -1);
    let bootstrap = device.install("bootstrap", &name, -1, 365);

    let handler = BootstrapCertificateHandler::new(
        paths(device.dir.path(), "management"),
        Some(paths(device.dir.path(), "bootstrap")),
    );
    assert!(handler.has_valid_bootstrap_certificate().await);
    let auth = handler.get_certificate_for_auth().await.unwrap();

    assert_eq!(auth.method, AuthMethod::Bootstrap);
    assert_eq!(
        auth.tls.leaf().unwrap(),
        CertificateData::from_pem(bootstrap.as_bytes()).unwrap()
    );
}

#[tokio::test]
async fn test_negative_threshold_leaves_state_alone() {
    let device = Device::new().await;
    let name = device.device_name();
    device.install("management", &name, -300, 25);
    let manager = device.manager();
    manager.inspect().await.unwrap();
    let cert = manager.certificate("static", "management").unwrap();
    let before = manager.lifecycle().get_state("static", "management");

    let err = manager.lifecycle().check_renewal(&cert, -1).await.unwrap_err();

    assert!(err.to_string().contains("non-negative"));
    assert_eq!(manager.lifecycle().get_state("static", "management"), before);
}
