//! Filterable, multi-subscriber envelope streams.
//!
//! Each subscribe call returns an independent, cancellable handle; delivery
//! starts at the point of subscription (no replay). Delivery is lossy
//! toward slow subscribers: a full queue drops the envelope rather than
//! stalling the demux loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crosswire_core::protocol::Envelope;

struct SubEntry {
    filter: Option<String>,
    tx: mpsc::Sender<Envelope>,
}

/// Registry of live subscribers for one stream (pushes or all messages).
pub struct SubscriptionRegistry {
    subs: DashMap<u64, SubEntry>,
    seq: AtomicU64,
    depth: usize,
}

impl SubscriptionRegistry {
    pub fn new(depth: usize) -> Self {
        Self {
            subs: DashMap::new(),
            seq: AtomicU64::new(1),
            depth,
        }
    }

    /// Subscribe with an optional exact-match filter on the stream key.
    pub fn subscribe(self: &Arc<Self>, filter: Option<String>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.depth);
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.subs.insert(id, SubEntry { filter, tx });
        Subscription {
            id,
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Fan `env` out to every subscriber whose filter matches `key`.
    /// Closed subscribers are pruned; full queues drop.
    pub fn publish(&self, key: &str, env: &Envelope) {
        let mut dead = Vec::new();
        for entry in self.subs.iter() {
            if let Some(filter) = &entry.value().filter {
                if filter != key {
                    continue;
                }
            }
            if entry.value().tx.try_send(env.clone()).is_err() && entry.value().tx.is_closed() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subs.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.len()
    }

    pub fn clear(&self) {
        self.subs.clear();
    }

    fn unsubscribe(&self, id: u64) {
        self.subs.remove(&id);
    }
}

/// Cancellable handle to one subscriber stream. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Envelope>,
    registry: Arc<SubscriptionRegistry>,
}

impl Subscription {
    /// Next envelope, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Explicit unsubscribe; equivalent to dropping the handle.
    pub fn close(&mut self) {
        self.registry.unsubscribe(self.id);
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn each_subscriber_sees_matching_envelopes() {
        let registry = Arc::new(SubscriptionRegistry::new(8));
        let mut all = registry.subscribe(None);
        let mut filtered = registry.subscribe(Some("progress".into()));

        let progress = Envelope::push("TASK_EVENT", "progress", None);
        let done = Envelope::push("TASK_EVENT", "done", None);
        registry.publish("progress", &progress);
        registry.publish("done", &done);

        assert_eq!(all.recv().await.unwrap().id, progress.id);
        assert_eq!(all.recv().await.unwrap().id, done.id);
        assert_eq!(filtered.recv().await.unwrap().id, progress.id);
        assert!(filtered.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_a_handle_unsubscribes() {
        let registry = Arc::new(SubscriptionRegistry::new(8));
        let sub = registry.subscribe(None);
        assert_eq!(registry.subscriber_count(), 1);
        drop(sub);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_stalling() {
        let registry = Arc::new(SubscriptionRegistry::new(1));
        let mut sub = registry.subscribe(None);

        let first = Envelope::push("E", "a", None);
        let second = Envelope::push("E", "b", None);
        registry.publish("a", &first);
        registry.publish("b", &second); // queue full: dropped

        assert_eq!(sub.recv().await.unwrap().id, first.id);
        assert!(sub.try_recv().is_none());
        assert_eq!(registry.subscriber_count(), 1);
    }
}
