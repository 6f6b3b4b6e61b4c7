//! Lightweight in-process counters for the duplex runtimes.
//!
//! Counters are plain atomics; per-type latency aggregates live in a
//! `DashMap` keyed by message type. Snapshots are serializable so the
//! SYSTEM_STATUS handler can dump them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Default)]
struct TypePerf {
    count: AtomicU64,
    total_micros: AtomicU64,
}

/// Shared message counters for one runtime instance (client or server).
#[derive(Default)]
pub struct RuntimeStats {
    sent: AtomicU64,
    received: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
    dropped_invalid: AtomicU64,
    per_type: DashMap<String, TypePerf>,
}

impl RuntimeStats {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// An inbound envelope failed decode or validation and was dropped.
    pub fn record_invalid(&self) {
        self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// A correlated exchange settled successfully; `elapsed` is the
    /// round-trip (client) or processing time (server).
    pub fn record_success(&self, msg_type: &str, elapsed: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        let perf = self.per_type.entry(msg_type.to_string()).or_default();
        perf.count.fetch_add(1, Ordering::Relaxed);
        perf.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            success_messages: self.success.load(Ordering::Relaxed),
            error_messages: self.error.load(Ordering::Relaxed),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
        }
    }

    /// Per-type average latency, sorted by message type for stable output.
    pub fn performance(&self) -> Vec<TypePerfSnapshot> {
        let mut rows: Vec<TypePerfSnapshot> = self
            .per_type
            .iter()
            .map(|entry| {
                let count = entry.value().count.load(Ordering::Relaxed);
                let total = entry.value().total_micros.load(Ordering::Relaxed);
                TypePerfSnapshot {
                    msg_type: entry.key().clone(),
                    count,
                    avg_micros: if count == 0 { 0 } else { total / count },
                }
            })
            .collect();
        rows.sort_by(|a, b| a.msg_type.cmp(&b.msg_type));
        rows
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub success_messages: u64,
    pub error_messages: u64,
    pub dropped_invalid: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypePerfSnapshot {
    pub msg_type: String,
    pub count: u64,
    pub avg_micros: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = RuntimeStats::default();
        stats.record_sent();
        stats.record_sent();
        stats.record_received();
        stats.record_success("TASK_SUBMIT", Duration::from_micros(200));
        stats.record_success("TASK_SUBMIT", Duration::from_micros(400));
        stats.record_error();
        stats.record_invalid();

        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.success_messages, 2);
        assert_eq!(snap.error_messages, 1);
        assert_eq!(snap.dropped_invalid, 1);

        let perf = stats.performance();
        assert_eq!(perf.len(), 1);
        assert_eq!(perf[0].msg_type, "TASK_SUBMIT");
        assert_eq!(perf[0].count, 2);
        assert_eq!(perf[0].avg_micros, 300);
    }
}
