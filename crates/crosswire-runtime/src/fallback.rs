//! Fallback controller: a circuit breaker at the feature-routing level.
//!
//! Samples the runtime's settled-call counters on an interval, computes the
//! error rate over a sliding window, and flips a shared flag once the rate
//! crosses the configured threshold. Callers check the flag to route new
//! calls through a legacy code path instead; the protocol itself is
//! untouched. Recovery needs the rate to fall to half the threshold, so
//! the flag does not flap around the boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crosswire_core::protocol::envelope::now_ms;

use crate::config::FallbackSection;
use crate::stats::RuntimeStats;

struct StatusInner {
    active: AtomicBool,
    reason: Mutex<Option<String>>,
    since_ms: AtomicU64,
}

/// Shared handle callers consult before routing a call.
#[derive(Clone)]
pub struct FallbackStatus {
    inner: Arc<StatusInner>,
}

impl Default for FallbackStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                active: AtomicBool::new(false),
                reason: Mutex::new(None),
                since_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Route new calls through the legacy path?
    pub fn should_use_fallback(&self) -> bool {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|r| r.clone())
    }

    /// When the fallback engaged, unix epoch ms. Zero when inactive.
    pub fn since_ms(&self) -> u64 {
        self.inner.since_ms.load(Ordering::Relaxed)
    }

    /// Manual operator reset.
    pub fn reset(&self) {
        self.clear();
    }

    fn engage(&self, reason: String) {
        if !self.inner.active.swap(true, Ordering::Relaxed) {
            tracing::warn!(%reason, "fallback engaged, demoting traffic to legacy path");
            self.inner.since_ms.store(now_ms(), Ordering::Relaxed);
        }
        if let Ok(mut slot) = self.inner.reason.lock() {
            *slot = Some(reason);
        }
    }

    fn clear(&self) {
        if self.inner.active.swap(false, Ordering::Relaxed) {
            tracing::info!("fallback cleared, traffic restored");
        }
        self.inner.since_ms.store(0, Ordering::Relaxed);
        if let Ok(mut slot) = self.inner.reason.lock() {
            *slot = None;
        }
    }
}

/// Sliding window of cumulative (success, error) samples.
struct Window {
    samples: VecDeque<(u64, u64)>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, success: u64, error: u64) {
        self.samples.push_back((success, error));
        while self.samples.len() > self.capacity + 1 {
            self.samples.pop_front();
        }
    }

    /// Error rate and total settled calls across the window, once at least
    /// two samples bound it.
    fn error_rate(&self) -> Option<(f64, u64)> {
        let (oldest_s, oldest_e) = self.samples.front()?;
        let (newest_s, newest_e) = self.samples.back()?;
        if self.samples.len() < 2 {
            return None;
        }
        let errors = newest_e.saturating_sub(*oldest_e);
        let total = newest_s.saturating_sub(*oldest_s) + errors;
        if total == 0 {
            return Some((0.0, 0));
        }
        Some((errors as f64 / total as f64, total))
    }
}

enum Decision {
    Engage(f64),
    Clear,
    Hold,
}

fn decide(cfg: &FallbackSection, active: bool, rate: f64, total: u64) -> Decision {
    if total >= cfg.min_samples && rate > cfg.error_rate_threshold {
        return Decision::Engage(rate);
    }
    if active && rate <= cfg.error_rate_threshold / 2.0 {
        return Decision::Clear;
    }
    Decision::Hold
}

/// Policy loop monitoring one runtime's error rate.
pub struct FallbackController {
    cfg: FallbackSection,
    stats: Arc<RuntimeStats>,
    status: FallbackStatus,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackController {
    pub fn new(cfg: FallbackSection, stats: Arc<RuntimeStats>) -> Self {
        Self {
            cfg,
            stats,
            status: FallbackStatus::new(),
            task: Mutex::new(None),
        }
    }

    /// The shared flag; clone freely.
    pub fn status(&self) -> FallbackStatus {
        self.status.clone()
    }

    /// Start the sampling loop. No-op when disabled or already running.
    pub fn spawn(&self) {
        if !self.cfg.enabled {
            return;
        }
        let Ok(mut slot) = self.task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let cfg = self.cfg.clone();
        let stats = Arc::clone(&self.stats);
        let status = self.status.clone();
        *slot = Some(tokio::spawn(async move {
            let capacity = (cfg.window_ms / cfg.sample_interval_ms).max(1) as usize;
            let mut window = Window::new(capacity);
            let mut tick =
                tokio::time::interval(Duration::from_millis(cfg.sample_interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let snap = stats.snapshot();
                window.push(snap.success_messages, snap.error_messages);
                let Some((rate, total)) = window.error_rate() else {
                    continue;
                };
                match decide(&cfg, status.should_use_fallback(), rate, total) {
                    Decision::Engage(rate) => status.engage(format!(
                        "error rate {:.0}% over {} calls exceeded threshold {:.0}%",
                        rate * 100.0,
                        total,
                        cfg.error_rate_threshold * 100.0
                    )),
                    Decision::Clear => status.clear(),
                    Decision::Hold => {}
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl Drop for FallbackController {
    fn drop(&mut self) {
        self.stop();
    }
}
