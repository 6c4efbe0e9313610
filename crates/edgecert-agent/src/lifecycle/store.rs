//! Owned registry of lifecycle records.
//!
//! The map lock is only held to find or insert an entry; field access goes
//! through the entry's own lock, so different certificates never contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::state::CertificateLifecycleState;

type Entry = Arc<Mutex<CertificateLifecycleState>>;

/// Lifecycle records keyed by `provider/certificate`.
#[derive(Debug, Default)]
pub struct LifecycleStateStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl LifecycleStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Entry {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }
        self.entries
            .write()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Copy of the record for `key`, created on first access.
    pub fn get(&self, key: &str) -> CertificateLifecycleState {
        self.entry(key).lock().clone()
    }

    /// Runs `f` with exclusive access to the record for `key`.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut CertificateLifecycleState) -> R) -> R {
        let entry = self.entry(key);
        let mut state = entry.lock();
        f(&mut state)
    }

    /// Drops the record for `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Whether a record exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Keys with a record, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
