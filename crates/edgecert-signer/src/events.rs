//! Append-only log of renewal and recovery events.

use edgecert_api::{CertificateRenewalEvent, RenewalEventType};
use parking_lot::RwLock;
use tracing::info;

/// In-memory audit log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: RwLock<Vec<CertificateRenewalEvent>>,
}

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn record(&self, event: CertificateRenewalEvent) {
        info!(
            device = %event.device_id,
            event = %event.event_type,
            reason = %event.reason,
            error = event.error_message.as_deref().unwrap_or(""),
            "certificate renewal event"
        );
        self.events.write().push(event);
    }

    /// Every event, oldest first.
    pub fn all(&self) -> Vec<CertificateRenewalEvent> {
        self.events.read().clone()
    }

    /// Events for one device, oldest first.
    pub fn for_device(&self, device_id: &str) -> Vec<CertificateRenewalEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Event types for one device, oldest first.
    pub fn types_for(&self, device_id: &str) -> Vec<RenewalEventType> {
        self.for_device(device_id).into_iter().map(|e| e.event_type).collect()
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_by_device() {
        let log = EventLog::new();
        log.record(CertificateRenewalEvent::new("dev-1", RenewalEventType::RenewalStart, "proactive"));
        log.record(CertificateRenewalEvent::new("dev-2", RenewalEventType::RecoveryStart, "expired"));
        log.record(CertificateRenewalEvent::new("dev-1", RenewalEventType::RenewalSuccess, "proactive"));

        assert_eq!(log.len(), 3);
        assert_eq!(
            log.types_for("dev-1"),
            vec![RenewalEventType::RenewalStart, RenewalEventType::RenewalSuccess]
        );
        assert!(log.for_device("dev-3").is_empty());
    }
}
