//! Connection registry and cached push queues.
//!
//! One `ConnectionRecord` per remote sender, created on first inbound
//! envelope and evicted after an inactivity window. Pushes addressed to an
//! unreachable sender wait in a bounded FIFO queue until that sender shows
//! up, then flush in order.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;

use crosswire_core::protocol::envelope::now_ms;
use crosswire_core::protocol::Envelope;

struct ConnectionRecord {
    last_seen_ms: u64,
    debug: bool,
    sent: u64,
    received: u64,
}

/// Serializable view of one connection, for SYSTEM_STATUS dumps.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub sender_id: String,
    pub last_seen_ms: u64,
    pub debug: bool,
    pub sent: u64,
    pub received: u64,
}

struct CachedPush {
    queued_at_ms: u64,
    env: Envelope,
}

#[derive(Default)]
struct CachedQueue {
    entries: VecDeque<CachedPush>,
}

pub struct ConnectionRegistry {
    records: DashMap<String, ConnectionRecord>,
    cached: DashMap<String, CachedQueue>,
    cache_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            cached: DashMap::new(),
            cache_capacity,
        }
    }

    /// Record inbound activity from `sender_id`. Creates the record on
    /// first sight. Returns `(first_seen, queued pushes to flush in FIFO
    /// order)`; the cache for that sender is cleared.
    pub fn touch(&self, sender_id: &str) -> (bool, Vec<Envelope>) {
        let now = now_ms();
        let first_seen = match self.records.get_mut(sender_id) {
            Some(mut record) => {
                record.last_seen_ms = now;
                record.received += 1;
                false
            }
            None => {
                self.records.insert(
                    sender_id.to_string(),
                    ConnectionRecord {
                        last_seen_ms: now,
                        debug: false,
                        sent: 0,
                        received: 1,
                    },
                );
                true
            }
        };

        let flush = self
            .cached
            .remove(sender_id)
            .map(|(_, queue)| queue.entries.into_iter().map(|c| c.env).collect())
            .unwrap_or_default();

        (first_seen, flush)
    }

    pub fn is_connected(&self, sender_id: &str) -> bool {
        self.records.contains_key(sender_id)
    }

    pub fn record_sent(&self, sender_id: &str) {
        if let Some(mut record) = self.records.get_mut(sender_id) {
            record.sent += 1;
        }
    }

    /// Flip the per-sender debug flag. Returns false for unknown senders.
    pub fn set_debug(&self, sender_id: &str, debug: bool) -> bool {
        match self.records.get_mut(sender_id) {
            Some(mut record) => {
                record.debug = debug;
                true
            }
            None => false,
        }
    }

    /// Explicit disconnect: drop the record and its cached pushes.
    pub fn remove(&self, sender_id: &str) -> bool {
        self.cached.remove(sender_id);
        self.records.remove(sender_id).is_some()
    }

    /// Queue a push for an unreachable sender. Bounded: the oldest entry is
    /// evicted once the queue is at capacity.
    pub fn cache_push(&self, sender_id: &str, env: Envelope) {
        let mut queue = self.cached.entry(sender_id.to_string()).or_default();
        if queue.entries.len() >= self.cache_capacity {
            queue.entries.pop_front();
        }
        queue.entries.push_back(CachedPush {
            queued_at_ms: now_ms(),
            env,
        });
    }

    pub fn cached_count(&self, sender_id: &str) -> usize {
        self.cached
            .get(sender_id)
            .map(|q| q.entries.len())
            .unwrap_or(0)
    }

    /// Evict records inactive past `inactivity_ms`, dropping their cached
    /// pushes, and prune orphan caches whose newest entry is just as stale.
    /// Returns the number of evicted records.
    pub fn sweep(&self, inactivity_ms: u64) -> usize {
        let cutoff = now_ms().saturating_sub(inactivity_ms);

        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.value().last_seen_ms < cutoff)
            .map(|r| r.key().clone())
            .collect();
        for sender_id in &expired {
            self.records.remove(sender_id);
            self.cached.remove(sender_id);
            tracing::debug!(sender_id = %sender_id, "evicted inactive connection");
        }

        self.cached.retain(|_, queue| {
            queue
                .entries
                .back()
                .map(|c| c.queued_at_ms >= cutoff)
                .unwrap_or(false)
        });

        expired.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids of every live connection, optionally restricted to debug-enabled
    /// senders.
    pub fn sender_ids(&self, debug_only: bool) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| !debug_only || r.value().debug)
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn connected(&self) -> Vec<ConnectionInfo> {
        let mut rows: Vec<ConnectionInfo> = self
            .records
            .iter()
            .map(|r| ConnectionInfo {
                sender_id: r.key().clone(),
                last_seen_ms: r.value().last_seen_ms,
                debug: r.value().debug,
                sent: r.value().sent,
                received: r.value().received,
            })
            .collect();
        rows.sort_by(|a, b| a.sender_id.cmp(&b.sender_id));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_creates_then_refreshes() {
        let registry = ConnectionRegistry::new(10);
        let (first, flush) = registry.touch("tab-1");
        assert!(first);
        assert!(flush.is_empty());
        let (first, _) = registry.touch("tab-1");
        assert!(!first);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cached_pushes_flush_in_fifo_order() {
        let registry = ConnectionRegistry::new(10);
        registry.cache_push("tab-1", Envelope::push("E", "a", None));
        registry.cache_push("tab-1", Envelope::push("E", "b", None));
        registry.cache_push("tab-1", Envelope::push("E", "c", None));
        assert_eq!(registry.cached_count("tab-1"), 3);

        let (_, flush) = registry.touch("tab-1");
        let order: Vec<String> = flush
            .iter()
            .map(|e| match &e.kind {
                crosswire_core::protocol::Kind::Push { event_type, .. } => event_type.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert_eq!(registry.cached_count("tab-1"), 0);
    }

    #[test]
    fn cache_evicts_oldest_at_capacity() {
        let registry = ConnectionRegistry::new(2);
        registry.cache_push("tab-1", Envelope::push("E", "a", None));
        registry.cache_push("tab-1", Envelope::push("E", "b", None));
        registry.cache_push("tab-1", Envelope::push("E", "c", None));
        assert_eq!(registry.cached_count("tab-1"), 2);

        let (_, flush) = registry.touch("tab-1");
        let order: Vec<String> = flush
            .iter()
            .map(|e| match &e.kind {
                crosswire_core::protocol::Kind::Push { event_type, .. } => event_type.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, ["b", "c"]);
    }

    #[test]
    fn sweep_evicts_stale_records_and_their_cache() {
        let registry = ConnectionRegistry::new(10);
        registry.touch("tab-1");
        registry.cache_push("tab-1", Envelope::push("E", "a", None));
        // Nothing is stale yet.
        assert_eq!(registry.sweep(60_000), 0);
        assert!(registry.is_connected("tab-1"));

        // Zero-tolerance sweep: everything seen before "now" is stale.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(registry.sweep(0), 1);
        assert!(!registry.is_connected("tab-1"));
        assert_eq!(registry.cached_count("tab-1"), 0);
    }

    #[test]
    fn remove_drops_record_and_cache() {
        let registry = ConnectionRegistry::new(10);
        registry.touch("tab-1");
        registry.cache_push("tab-1", Envelope::push("E", "a", None));
        assert!(registry.remove("tab-1"));
        assert!(!registry.remove("tab-1"));
        assert_eq!(registry.cached_count("tab-1"), 0);
    }

    #[test]
    fn debug_flag_restricts_sender_listing() {
        let registry = ConnectionRegistry::new(10);
        registry.touch("tab-1");
        registry.touch("tab-2");
        assert!(registry.set_debug("tab-2", true));
        assert!(!registry.set_debug("ghost", true));

        let mut all = registry.sender_ids(false);
        all.sort();
        assert_eq!(all, ["tab-1", "tab-2"]);
        assert_eq!(registry.sender_ids(true), ["tab-2"]);
    }
}
