//! Property tests for expiry arithmetic and the lifecycle state store.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, TimeZone, Utc};
use edgecert_agent::{CertificateData, CertificateState, ExpirationMonitor, LifecycleStateStore};
use edgecert_signer::SigningCa;
use proptest::prelude::*;

fn fixed(now: DateTime<Utc>) -> ExpirationMonitor {
    ExpirationMonitor::with_clock(Arc::new(move || now))
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

/// One certificate valid for a year from [`epoch`].
fn certificate() -> &'static CertificateData {
    static CERT: OnceLock<CertificateData> = OnceLock::new();
    CERT.get_or_init(|| {
        let ca = SigningCa::generate("Fleet CA").unwrap();
        let pair = ca.issue("device", epoch(), epoch() + Duration::days(365)).unwrap();
        CertificateData::from_pem(pair.cert_pem.as_bytes()).unwrap()
    })
}

proptest! {
    #[test]
    fn prop_days_decrease_as_time_passes(a in 0i64..800 * 86_400, b in 0i64..800 * 86_400) {
        let (early, late) = if a <= b { (a, b) } else { (b, a) };
        let not_after = epoch() + Duration::days(365);
        let d_early = fixed(epoch() + Duration::seconds(early)).days_until(not_after);
        let d_late = fixed(epoch() + Duration::seconds(late)).days_until(not_after);
        prop_assert!(d_late <= d_early);
    }

    #[test]
    fn prop_days_truncate_toward_zero(offset in -1000i64 * 86_400..1000 * 86_400) {
        let now = epoch();
        let days = fixed(now).days_until(now + Duration::seconds(offset));
        prop_assert_eq!(days, offset / 86_400);
        prop_assert!(days.abs() * 86_400 <= offset.abs());
    }

    #[test]
    fn prop_larger_threshold_never_unflags(elapsed_days in 0i64..400, t1 in 0i64..400, t2 in 0i64..400) {
        let (low, high) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
        let monitor = fixed(epoch() + Duration::days(elapsed_days));
        let cert = certificate();
        if monitor.is_expiring_soon(cert, low).unwrap() {
            prop_assert!(monitor.is_expiring_soon(cert, high).unwrap());
        }
        if monitor.is_expired(cert).unwrap() {
            prop_assert!(monitor.is_expiring_soon(cert, low).unwrap());
        }
    }

    #[test]
    fn prop_negative_threshold_always_rejected(threshold in i64::MIN..0) {
        let monitor = fixed(epoch());
        let err = monitor.is_expiring_soon(certificate(), threshold).unwrap_err();
        prop_assert!(err.to_string().contains("non-negative"));
    }
}

#[test]
fn test_concurrent_store_writers_do_not_lose_updates() {
    let store = Arc::new(LifecycleStateStore::new());
    let writers: Vec<_> = (0..8)
        .map(|w| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let key = format!("static/cert-{}", i % 4);
                    store.update(&key, |record| {
                        record.days_until_expiration += 1;
                        record.state = if w % 2 == 0 {
                            CertificateState::Normal
                        } else {
                            CertificateState::ExpiringSoon
                        };
                    });
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(store.len(), 4);
    let total: i64 = store.keys().iter().map(|k| store.get(k).days_until_expiration).sum();
    assert_eq!(total, 8 * 500);
}
