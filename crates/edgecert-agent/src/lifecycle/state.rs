//! Certificate lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CertError;

/// Health of a managed certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateState {
    /// Valid and outside the renewal window.
    #[default]
    Normal,
    /// Inside the renewal window.
    ExpiringSoon,
    /// Renewal in progress.
    Renewing,
    /// Past `NotAfter`.
    Expired,
    /// Expired-certificate recovery in progress.
    Recovering,
    /// The last renewal attempt failed.
    RenewalFailed,
}

impl CertificateState {
    /// Every state, in declaration order.
    pub const ALL: [CertificateState; 6] = [
        CertificateState::Normal,
        CertificateState::ExpiringSoon,
        CertificateState::Renewing,
        CertificateState::Expired,
        CertificateState::Recovering,
        CertificateState::RenewalFailed,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateState::Normal => "normal",
            CertificateState::ExpiringSoon => "expiring_soon",
            CertificateState::Renewing => "renewing",
            CertificateState::Expired => "expired",
            CertificateState::Recovering => "recovering",
            CertificateState::RenewalFailed => "renewal_failed",
        }
    }

    /// Whether `s` names one of the six states.
    pub fn is_valid_state(s: &str) -> bool {
        s.parse::<CertificateState>().is_ok()
    }

    /// Whether an operation for this certificate is in flight.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, CertificateState::Renewing | CertificateState::Recovering)
    }

    /// Whether moving to `next` follows the lifecycle graph.
    ///
    /// Staying in the same state is always allowed. `renewal_failed` may be
    /// re-evaluated by the next check into any health state.
    pub fn is_transition_allowed(&self, next: CertificateState) -> bool {
        use CertificateState::*;
        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Normal, ExpiringSoon)
                | (Normal, Expired)
                | (Normal, Renewing)
                | (ExpiringSoon, Normal)
                | (ExpiringSoon, Renewing)
                | (ExpiringSoon, Expired)
                | (Renewing, Normal)
                | (Renewing, RenewalFailed)
                | (Expired, Recovering)
                | (Recovering, Normal)
                | (RenewalFailed, Normal)
                | (RenewalFailed, ExpiringSoon)
                | (RenewalFailed, Renewing)
                | (RenewalFailed, Expired)
        )
    }
}

impl fmt::Display for CertificateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateState {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CertificateState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CertError::InvalidState(s.to_string()))
    }
}

/// Lifecycle record of one certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateLifecycleState {
    /// Current state.
    pub state: CertificateState,
    /// Whole days until expiry; negative once expired.
    pub days_until_expiration: i64,
    /// `NotAfter` of the certificate last checked.
    pub expiration_time: Option<DateTime<Utc>>,
    /// Time of the last update.
    pub last_checked: Option<DateTime<Utc>>,
    /// Message of the last recorded failure.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for state in CertificateState::ALL {
            assert_eq!(state.as_str().parse::<CertificateState>().unwrap(), state);
            assert!(CertificateState::is_valid_state(state.as_str()));
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "Normal", "pending", "renewal-failed"] {
            assert!(!CertificateState::is_valid_state(name));
        }
        let err = "bogus".parse::<CertificateState>().unwrap_err();
        assert_eq!(err.to_string(), "invalid certificate state 'bogus'");
    }

    #[test]
    fn test_transitions() {
        use CertificateState::*;
        assert!(Normal.is_transition_allowed(ExpiringSoon));
        assert!(ExpiringSoon.is_transition_allowed(Renewing));
        assert!(Renewing.is_transition_allowed(RenewalFailed));
        assert!(Expired.is_transition_allowed(Recovering));
        assert!(Recovering.is_transition_allowed(Normal));
        assert!(Recovering.is_transition_allowed(Recovering));
        assert!(!Normal.is_transition_allowed(Recovering));
        assert!(!Expired.is_transition_allowed(Normal));
        assert!(!Renewing.is_transition_allowed(Expired));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&CertificateState::RenewalFailed).unwrap();
        assert_eq!(json, "\"renewal_failed\"");
    }
}
