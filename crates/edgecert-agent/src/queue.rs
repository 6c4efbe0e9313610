//! Processing queue for certificate provisioning work.
//!
//! Holds at most one entry per `provider/certificate` key. An entry is either
//! waiting (optionally until a requeue deadline) or in flight with a worker.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CertificateConfig;

/// Work item for one certificate.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// `provider/certificate`.
    pub key: String,
    /// Config provider name.
    pub provider: String,
    /// Certificate name.
    pub name: String,
    /// Declaration the work was queued for.
    pub config: CertificateConfig,
    /// Cancelled when the entry is replaced or removed.
    pub token: CancellationToken,
    generation: u64,
}

impl QueueItem {
    /// Identifies this entry among replacements of the same key.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What [`ProcessingQueue::enqueue`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New entry.
    Added,
    /// Entry with the same config already present; left alone.
    Unchanged,
    /// Entry with a different config was cancelled and replaced.
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Waiting,
    InFlight,
}

#[derive(Debug)]
struct Entry {
    item: QueueItem,
    status: Status,
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    ready: VecDeque<String>,
    next_generation: u64,
}

impl Inner {
    fn new_item(&mut self, provider: &str, config: CertificateConfig, parent: &CancellationToken) -> QueueItem {
        self.next_generation += 1;
        QueueItem {
            key: crate::certificate::certificate_key(provider, &config.name),
            provider: provider.to_string(),
            name: config.name.clone(),
            config,
            token: parent.child_token(),
            generation: self.next_generation,
        }
    }

    fn push_ready(&mut self, key: &str) {
        if !self.ready.iter().any(|k| k == key) {
            self.ready.push_back(key.to_string());
        }
    }
}

/// Keyed work queue with delayed requeue.
#[derive(Debug)]
pub struct ProcessingQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    root: CancellationToken,
}

impl Default for ProcessingQueue {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl ProcessingQueue {
    /// Empty queue. Item tokens are children of `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            root,
        }
    }

    /// Queues work for `config`, keeping one entry per key.
    pub fn enqueue(&self, provider: &str, config: CertificateConfig) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        let key = crate::certificate::certificate_key(provider, &config.name);

        let outcome = match inner.entries.get(&key) {
            Some(existing) if existing.item.config == config => return EnqueueOutcome::Unchanged,
            Some(existing) => {
                existing.item.token.cancel();
                debug!(certificate = %key, "config changed, replacing queued work");
                EnqueueOutcome::Replaced
            }
            None => EnqueueOutcome::Added,
        };

        let item = inner.new_item(provider, config, &self.root);
        inner.entries.insert(
            key.clone(),
            Entry {
                item,
                status: Status::Waiting,
                not_before: None,
            },
        );
        inner.push_ready(&key);
        drop(inner);
        self.notify.notify_one();
        outcome
    }

    /// Waits for the next due entry and marks it in flight.
    ///
    /// Returns `None` once `token` is cancelled.
    pub async fn next(&self, token: &CancellationToken) -> Option<QueueItem> {
        loop {
            let wake_at = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                let mut earliest: Option<Instant> = None;
                let mut due = None;
                for (idx, key) in inner.ready.iter().enumerate() {
                    match inner.entries.get(key).and_then(|e| e.not_before) {
                        Some(at) if at > now => {
                            earliest = Some(earliest.map_or(at, |e: Instant| e.min(at)));
                        }
                        _ => {
                            due = Some(idx);
                            break;
                        }
                    }
                }
                if let Some(idx) = due {
                    if let Some(key) = inner.ready.remove(idx) {
                        if let Some(entry) = inner.entries.get_mut(&key) {
                            entry.status = Status::InFlight;
                            entry.not_before = None;
                            return Some(entry.item.clone());
                        }
                    }
                    continue;
                }
                earliest
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    /// Removes a finished entry. Ignored if the entry was replaced meanwhile.
    pub fn complete(&self, item: &QueueItem) -> bool {
        let mut inner = self.inner.lock();
        let current = inner
            .entries
            .get(&item.key)
            .is_some_and(|e| e.item.generation == item.generation && e.status == Status::InFlight);
        if current {
            inner.entries.remove(&item.key);
        }
        current
    }

    /// Puts an in-flight entry back, due after `delay`.
    pub fn requeue(&self, item: &QueueItem, delay: Duration) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&item.key) else {
            return false;
        };
        if entry.item.generation != item.generation || entry.status != Status::InFlight {
            return false;
        }
        entry.status = Status::Waiting;
        entry.not_before = Some(Instant::now() + delay);
        inner.push_ready(&item.key);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Cancels and removes the entry for `key`.
    pub fn cancel(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.remove(key) else {
            return false;
        };
        entry.item.token.cancel();
        inner.ready.retain(|k| k != key);
        true
    }

    /// Whether an entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Number of entries, waiting or in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the queue has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypedConfig;

    fn config(name: &str, days: u64) -> CertificateConfig {
        CertificateConfig {
            name: name.to_string(),
            provisioner: TypedConfig::new("self-signed", serde_json::json!({ "validity_days": days })),
            storage: TypedConfig::new("filesystem", serde_json::json!({})),
        }
    }

    #[tokio::test]
    async fn test_one_entry_per_key() {
        let queue = ProcessingQueue::default();
        assert_eq!(queue.enqueue("static", config("web", 10)), EnqueueOutcome::Added);
        assert_eq!(queue.enqueue("static", config("web", 10)), EnqueueOutcome::Unchanged);
        assert_eq!(queue.enqueue("drop-in", config("web", 10)), EnqueueOutcome::Added);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_replace_cancels_old_token() {
        let queue = ProcessingQueue::default();
        let token = CancellationToken::new();
        queue.enqueue("static", config("web", 10));
        let first = queue.next(&token).await.unwrap();

        assert_eq!(queue.enqueue("static", config("web", 20)), EnqueueOutcome::Replaced);
        assert!(first.token.is_cancelled());
        assert_eq!(queue.len(), 1);
        assert!(!queue.complete(&first));

        let second = queue.next(&token).await.unwrap();
        assert_eq!(second.config.provisioner.param_u64("validity_days"), Some(20));
        assert!(!second.token.is_cancelled());
        assert!(queue.complete(&second));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_delay() {
        let queue = ProcessingQueue::default();
        let token = CancellationToken::new();
        queue.enqueue("static", config("web", 10));
        let item = queue.next(&token).await.unwrap();
        assert!(queue.requeue(&item, Duration::from_secs(10)));

        let start = Instant::now();
        let again = queue.next(&token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(again.generation(), item.generation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_entry_does_not_block_others() {
        let queue = ProcessingQueue::default();
        let token = CancellationToken::new();
        queue.enqueue("static", config("slow", 10));
        let slow = queue.next(&token).await.unwrap();
        queue.requeue(&slow, Duration::from_secs(60));
        queue.enqueue("static", config("fast", 10));

        let start = Instant::now();
        let next = queue.next(&token).await.unwrap();
        assert_eq!(next.name, "fast");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancel_removes_entry() {
        let queue = ProcessingQueue::default();
        queue.enqueue("static", config("web", 10));
        assert!(queue.cancel("static/web"));
        assert!(!queue.cancel("static/web"));
        assert!(!queue.contains("static/web"));
    }

    #[tokio::test]
    async fn test_next_returns_none_on_shutdown() {
        let queue = ProcessingQueue::default();
        let token = CancellationToken::new();
        token.cancel();
        assert!(queue.next(&token).await.is_none());
    }
}
