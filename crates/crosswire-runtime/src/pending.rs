//! Request manager: the initiator-side pending table.
//!
//! Gives the initiator at-most-N-concurrent, timeout-bounded calls over the
//! channel. Each in-flight request is one entry: inserted on send, removed
//! on settle/cancel/cleanup; no entry outlives its timer. Exactly one of
//! resolve/reject fires per entry: the oneshot sender makes double
//! settlement unrepresentable, and the `DashMap::remove` that precedes
//! every settlement makes the race single-winner.
//!
//! Retries live *outside* this table: `execute_with_retry` re-invokes the
//! send with a fresh envelope per attempt, sleeping the computed backoff in
//! between. A timeout here never auto-retries.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crosswire_core::protocol::retry::{RetryPolicy, RetryPredicate};
use crosswire_core::protocol::validate::DEFAULT_TIMEOUT_MS;
use crosswire_core::protocol::{Envelope, Kind, Status};
use crosswire_core::{CrosswireError, Result};

use crate::stats::RuntimeStats;
use crate::transport::{self, Transport};

/// Default cap on concurrently in-flight requests.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;
/// Default hard ceiling after which the cleanup sweep force-cancels.
pub const DEFAULT_REQUEST_CEILING_MS: u64 = 300_000;

struct PendingRequest {
    msg_type: String,
    created_at: Instant,
    timeout: Option<JoinHandle<()>>,
    tx: oneshot::Sender<Result<Option<Value>>>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    stats: Arc<RuntimeStats>,
    pending: DashMap<String, PendingRequest>,
    max_in_flight: usize,
}

impl ManagerInner {
    /// Settle the entry for `id` exactly once. Returns false when no entry
    /// exists (already settled, cancelled, or never sent).
    fn settle(&self, id: &str, result: Result<Option<Value>>) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            return false;
        };
        if let Some(timer) = entry.timeout {
            timer.abort();
        }
        match &result {
            Ok(_) => self
                .stats
                .record_success(&entry.msg_type, entry.created_at.elapsed()),
            Err(_) => self.stats.record_error(),
        }
        // Receiver may be gone if the caller stopped waiting; nothing to do.
        let _ = entry.tx.send(result);
        true
    }
}

/// Initiator-side table of in-flight requests.
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<ManagerInner>,
}

impl RequestManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        stats: Arc<RuntimeStats>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                stats,
                pending: DashMap::new(),
                max_in_flight,
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    /// Register, transmit, and await settlement of one request envelope.
    ///
    /// Fails fast with a concurrency error at the in-flight cap. Excess
    /// requests are never queued; queueing would silently eat into the
    /// caller's deadline.
    pub async fn send_request(&self, env: Envelope) -> Result<Option<Value>> {
        let in_flight = self.inner.pending.len();
        if in_flight >= self.inner.max_in_flight {
            return Err(CrosswireError::ConcurrencyLimit {
                in_flight,
                cap: self.inner.max_in_flight,
            });
        }

        let timeout_ms = match &env.kind {
            Kind::Request { timeout_ms, .. } => timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            _ => {
                return Err(CrosswireError::Internal(
                    "send_request requires a request envelope".into(),
                ))
            }
        };

        let frame = transport::encode(&env)?;
        let id = env.id.clone();
        let (tx, rx) = oneshot::channel();

        self.inner.pending.insert(
            id.clone(),
            PendingRequest {
                msg_type: env.msg_type.clone(),
                created_at: Instant::now(),
                timeout: None,
                tx,
            },
        );

        let timer = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let id = id.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if inner.settle(&id, Err(CrosswireError::Timeout(timeout_ms))) {
                    tracing::debug!(id = %id, timeout_ms, "request timed out");
                }
            }
        });
        match self.inner.pending.get_mut(&id) {
            Some(mut entry) => entry.timeout = Some(timer),
            // Entry already settled before we could attach the timer.
            None => timer.abort(),
        }

        if let Err(e) = self.inner.transport.send(frame).await {
            self.inner.settle(&id, Err(e));
        } else {
            self.inner.stats.record_sent();
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CrosswireError::Cancelled("request manager dropped".into())),
        }
    }

    /// Correlate an inbound response to its pending entry. Unknown or
    /// stale ids are logged and dropped, never fatal, and never affect
    /// other entries.
    pub fn handle_response(&self, env: Envelope) {
        let Kind::Response {
            request_id,
            status,
            error,
        } = env.kind
        else {
            tracing::debug!(id = %env.id, "handle_response fed a non-response envelope");
            return;
        };

        let result = match status {
            Status::Success => Ok(env.payload),
            Status::Error => {
                let info = error.unwrap_or_else(|| {
                    CrosswireError::Internal("error response without error info".into()).to_info()
                });
                Err(CrosswireError::Remote(info))
            }
        };

        if !self.inner.settle(&request_id, result) {
            tracing::debug!(
                request_id = %request_id,
                "response for unknown request id dropped (timed out or cancelled)"
            );
        }
    }

    /// Force-reject one outstanding request.
    pub fn cancel_request(&self, id: &str) -> bool {
        self.inner
            .settle(id, Err(CrosswireError::Cancelled("cancelled by caller".into())))
    }

    /// Force-reject every outstanding request (teardown).
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for id in ids {
            if self
                .inner
                .settle(&id, Err(CrosswireError::Cancelled("shutting down".into())))
            {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Backstop sweep: force-cancel entries older than `ceiling` that
    /// somehow missed their own timer. Not the primary timeout mechanism.
    pub fn cleanup_expired(&self, ceiling: Duration) -> usize {
        let expired: Vec<String> = self
            .inner
            .pending
            .iter()
            .filter(|e| e.value().created_at.elapsed() > ceiling)
            .map(|e| e.key().clone())
            .collect();
        let mut cleaned = 0;
        for id in expired {
            if self
                .inner
                .settle(&id, Err(CrosswireError::Timeout(ceiling.as_millis() as u64)))
            {
                tracing::warn!(id = %id, "cleanup sweep cancelled a stuck request");
                cleaned += 1;
            }
        }
        cleaned
    }
}

/// Drive `op` through up to `policy.max_attempts` serial attempts, sleeping
/// the computed backoff between failures. `op` receives the 0-based attempt
/// index and must build a fresh request per call (fresh envelope id, so
/// delivery stays at-most-once per attempt).
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    predicate: Option<&RetryPredicate>,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let attempts_so_far = attempt + 1;
                if !policy.should_retry(&error, attempts_so_far, predicate) {
                    return Err(error);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt = attempts_so_far,
                    delay_ms = delay,
                    error = %error,
                    "retrying after backoff"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt = attempts_so_far;
            }
        }
    }
}
