//! Registry and router for inbound envelopes.
//!
//! Exactly one handler serves an envelope: exact type matches win in
//! registration order, then wildcard handlers ordered by declared priority.
//! The middleware chain runs first and may rewrite or abort; error
//! observers see every handler failure before it propagates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crosswire_core::protocol::Envelope;
use crosswire_core::{CrosswireError, Result};

use super::middleware::Middleware;

/// One message handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Registry name, used for unregistration.
    fn name(&self) -> &str;

    /// Message types this handler accepts. Empty = wildcard.
    fn accepts(&self) -> Vec<String> {
        Vec::new()
    }

    /// Orders wildcard handlers; higher runs first. Ignored for exact
    /// matches.
    fn priority(&self) -> i32 {
        0
    }

    /// Final say on whether this handler takes the envelope.
    fn can_handle(&self, msg_type: &str) -> bool {
        let accepts = self.accepts();
        accepts.is_empty() || accepts.iter().any(|t| t == msg_type)
    }

    async fn handle(&self, env: &Envelope) -> Result<Option<Value>>;
}

/// Observer invoked on every handler failure (logging, retry bookkeeping).
pub type ErrorObserver = Arc<dyn Fn(&CrosswireError, &Envelope) + Send + Sync>;

struct Registered {
    handler: Arc<dyn Handler>,
    name: String,
    accepts: Vec<String>,
    priority: i32,
    seq: u64,
}

#[derive(Default)]
struct TypeAgg {
    count: AtomicU64,
    total_micros: AtomicU64,
}

/// Per-router counters: processed/succeeded/failed plus average processing
/// time overall, per type, and per type-category.
#[derive(Default)]
struct RouterStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_micros: AtomicU64,
    per_type: DashMap<String, TypeAgg>,
    per_category: DashMap<String, AtomicU64>,
}

#[derive(Default)]
pub struct Router {
    handlers: RwLock<Vec<Registered>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    error_observers: RwLock<Vec<ErrorObserver>>,
    stats: RouterStats,
    seq: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. `accepts` and `priority` are snapshotted here;
    /// `can_handle` stays live.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        let registered = Registered {
            name: handler.name().to_string(),
            accepts: handler.accepts(),
            priority: handler.priority(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            handler,
        };
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(registered);
        }
    }

    /// Remove a handler by name. Returns whether anything was removed.
    pub fn unregister_handler(&self, name: &str) -> bool {
        match self.handlers.write() {
            Ok(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|r| r.name != name);
                handlers.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn register_middleware(&self, mw: Arc<dyn Middleware>) {
        if let Ok(mut chain) = self.middleware.write() {
            chain.push(mw);
        }
    }

    pub fn register_error_observer(&self, observer: ErrorObserver) {
        if let Ok(mut observers) = self.error_observers.write() {
            observers.push(observer);
        }
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .map(|h| h.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Dispatch one envelope to exactly one handler.
    pub async fn route(&self, env: Envelope) -> Result<Option<Value>> {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let msg_type = env.msg_type.clone();

        let result = self.route_inner(env).await;
        match &result {
            Ok(_) => self.record_success(&msg_type, started.elapsed()),
            Err(_) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn route_inner(&self, mut env: Envelope) -> Result<Option<Value>> {
        let chain: Vec<Arc<dyn Middleware>> = self
            .middleware
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        for mw in chain {
            env = mw.call(env).await?;
        }

        let handler = self
            .select(&env.msg_type)
            .ok_or_else(|| CrosswireError::HandlerNotFound(env.msg_type.clone()))?;

        match handler.handle(&env).await {
            Ok(value) => Ok(value),
            Err(error) => {
                let observers: Vec<ErrorObserver> = self
                    .error_observers
                    .read()
                    .map(|o| o.clone())
                    .unwrap_or_default();
                for observer in observers {
                    observer(&error, &env);
                }
                Err(error)
            }
        }
    }

    /// First exact match in registration order, then wildcards by priority
    /// (descending, registration order breaking ties).
    fn select(&self, msg_type: &str) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().ok()?;

        let exact = handlers
            .iter()
            .filter(|r| r.accepts.iter().any(|t| t == msg_type))
            .find(|r| r.handler.can_handle(msg_type));
        if let Some(r) = exact {
            return Some(Arc::clone(&r.handler));
        }

        let mut wildcards: Vec<&Registered> =
            handlers.iter().filter(|r| r.accepts.is_empty()).collect();
        wildcards.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        wildcards
            .into_iter()
            .find(|r| r.handler.can_handle(msg_type))
            .map(|r| Arc::clone(&r.handler))
    }

    fn record_success(&self, msg_type: &str, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        self.stats.total_micros.fetch_add(micros, Ordering::Relaxed);

        let agg = self.stats.per_type.entry(msg_type.to_string()).or_default();
        agg.count.fetch_add(1, Ordering::Relaxed);
        agg.total_micros.fetch_add(micros, Ordering::Relaxed);

        let category = msg_type
            .split_once('_')
            .map(|(head, _)| head)
            .unwrap_or(msg_type);
        self.stats
            .per_category
            .entry(category.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        let succeeded = self.stats.succeeded.load(Ordering::Relaxed);
        let total_micros = self.stats.total_micros.load(Ordering::Relaxed);

        let mut per_type: Vec<TypeStatsRow> = self
            .stats
            .per_type
            .iter()
            .map(|entry| {
                let count = entry.value().count.load(Ordering::Relaxed);
                let total = entry.value().total_micros.load(Ordering::Relaxed);
                TypeStatsRow {
                    msg_type: entry.key().clone(),
                    count,
                    avg_micros: if count == 0 { 0 } else { total / count },
                }
            })
            .collect();
        per_type.sort_by(|a, b| a.msg_type.cmp(&b.msg_type));

        let mut per_category: Vec<(String, u64)> = self
            .stats
            .per_category
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        per_category.sort();

        RouterStatsSnapshot {
            processed: self.stats.processed.load(Ordering::Relaxed),
            succeeded,
            failed: self.stats.failed.load(Ordering::Relaxed),
            avg_micros: if succeeded == 0 {
                0
            } else {
                total_micros / succeeded
            },
            per_type,
            per_category,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeStatsRow {
    pub msg_type: String,
    pub count: u64,
    pub avg_micros: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_micros: u64,
    pub per_type: Vec<TypeStatsRow>,
    pub per_category: Vec<(String, u64)>,
}
