//! Duplex server: the responder-side façade.
//!
//! Tracks one connection record per remote sender, drives the router, and
//! answers REQUEST-mode traffic with a correlated response to that sender
//! only. Pushes to unreachable senders wait in bounded FIFO caches and
//! flush on reconnect. A background sweep evicts inactive senders.

pub mod connections;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crosswire_core::protocol::envelope::now_ms;
use crosswire_core::protocol::{redact, sanitize, system, validate, Envelope, Kind, Priority};
use crosswire_core::{CrosswireError, Result};

use crate::config::ServerSection;
use crate::dispatch::{Handler, LoggingMiddleware, Router, RouterStatsSnapshot, ValidationMiddleware};
use crate::stats::{RuntimeStats, StatsSnapshot};
use crate::transport::{self, Transport};

pub use connections::{ConnectionInfo, ConnectionRegistry};

/// Broadcast knobs.
#[derive(Clone, Debug, Default)]
pub struct BroadcastOptions {
    pub priority: Option<Priority>,
    /// Skip this sender (typically the one that triggered the broadcast).
    pub exclude: Option<String>,
    /// Restrict delivery to debug-enabled senders.
    pub debug_only: bool,
}

/// Server-side stats dump.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    #[serde(flatten)]
    pub messages: StatsSnapshot,
    pub router: RouterStatsSnapshot,
    pub connections: usize,
}

struct ServerInner {
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    connections: Arc<ConnectionRegistry>,
    cfg: ServerSection,
    stats: Arc<RuntimeStats>,
    debug: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Responder-side façade over the channel.
#[derive(Clone)]
pub struct DuplexServer {
    inner: Arc<ServerInner>,
}

impl DuplexServer {
    pub fn new(transport: Arc<dyn Transport>, cfg: ServerSection) -> Self {
        let connections = Arc::new(ConnectionRegistry::new(cfg.push_cache_capacity));
        let stats = Arc::new(RuntimeStats::default());
        let debug = Arc::new(AtomicBool::new(false));

        let router = Arc::new(Router::new());
        router.register_middleware(Arc::new(ValidationMiddleware));
        router.register_middleware(Arc::new(LoggingMiddleware::new(Arc::clone(&debug))));
        router.register_handler(Arc::new(SystemService {
            connections: Arc::clone(&connections),
            stats: Arc::clone(&stats),
        }));

        Self {
            inner: Arc::new(ServerInner {
                transport,
                router,
                connections,
                cfg,
                stats,
                debug,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach the inbound queue and start the receive/sweep loop.
    pub fn serve(&self) {
        let Some(mut inbox) = self.inner.transport.take_inbox() else {
            tracing::warn!("serve called twice; inbound queue already taken");
            return;
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut sweep =
                tokio::time::interval(Duration::from_millis(inner.cfg.sweep_interval_ms));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    maybe = inbox.recv() => {
                        let Some(frame) = maybe else {
                            tracing::warn!("inbound channel closed; server stopping");
                            break;
                        };
                        handle_frame(&inner, frame).await;
                    }
                    _ = sweep.tick() => {
                        let evicted = inner.connections.sweep(inner.cfg.inactivity_timeout_ms);
                        if evicted > 0 {
                            tracing::info!(evicted, "swept inactive connections");
                        }
                    }
                }
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Feed one raw frame through parse -> validate -> sanitize -> route.
    /// Invalid traffic is dropped with a warning; this never errors into
    /// the transport loop.
    pub async fn handle_message(&self, raw: Bytes) {
        handle_frame(&self.inner, raw).await;
    }

    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        self.inner.router.register_handler(handler);
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.inner.router.unregister_handler(name)
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.inner.router)
    }

    /// Unicast push. Delivered immediately to a live sender; cached
    /// (bounded, FIFO-evicting) for an unreachable one. Returns whether the
    /// push went out now.
    pub async fn push_to_client(
        &self,
        sender_id: &str,
        msg_type: impl Into<String>,
        event_type: impl Into<String>,
        data: Option<Value>,
    ) -> Result<bool> {
        let env = sanitize(
            Envelope::push(msg_type, event_type, data)
                .with_sender(&self.inner.cfg.server_id)
                .with_target(sender_id)
                .persistent(),
        );

        if !self.inner.connections.is_connected(sender_id) {
            tracing::debug!(sender_id, "target unreachable; push cached");
            self.inner.connections.cache_push(sender_id, env);
            return Ok(false);
        }

        let frame = transport::encode(&env)?;
        self.inner.transport.send(frame).await?;
        self.inner.stats.record_sent();
        self.inner.connections.record_sent(sender_id);
        Ok(true)
    }

    /// Push to every known connection. Returns the number of senders the
    /// push was delivered to.
    pub async fn broadcast(
        &self,
        msg_type: impl Into<String>,
        event_type: impl Into<String>,
        data: Option<Value>,
        options: BroadcastOptions,
    ) -> usize {
        let msg_type = msg_type.into();
        let event_type = event_type.into();
        // Redact once; every per-target envelope reuses the clean payload.
        let data = data.map(redact);

        let targets: Vec<String> = self
            .inner
            .connections
            .sender_ids(options.debug_only)
            .into_iter()
            .filter(|id| options.exclude.as_deref() != Some(id.as_str()))
            .collect();

        let mut sends = FuturesUnordered::new();
        for target in targets {
            let mut env = Envelope::push(&msg_type, &event_type, data.clone())
                .with_sender(&self.inner.cfg.server_id)
                .with_target(&target);
            if let Some(priority) = options.priority {
                env = env.with_priority(priority);
            }
            let frame = match transport::encode(&env) {
                Ok(frame) => frame,
                Err(error) => {
                    tracing::warn!(%error, "broadcast encode failed");
                    continue;
                }
            };
            let transport = Arc::clone(&self.inner.transport);
            sends.push(async move { transport.send(frame).await.is_ok().then_some(target) });
        }

        let mut delivered = 0;
        while let Some(outcome) = sends.next().await {
            if let Some(target) = outcome {
                self.inner.stats.record_sent();
                self.inner.connections.record_sent(&target);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connected_clients(&self) -> Vec<ConnectionInfo> {
        self.inner.connections.connected()
    }

    pub fn enable_debug(&self) {
        self.inner.debug.store(true, Ordering::Relaxed);
    }

    pub fn disable_debug(&self) {
        self.inner.debug.store(false, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            messages: self.inner.stats.snapshot(),
            router: self.inner.router.stats(),
            connections: self.inner.connections.len(),
        }
    }

    /// Stop the receive/sweep loop.
    pub fn destroy(&self) {
        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
    }
}

async fn handle_frame(inner: &Arc<ServerInner>, raw: Bytes) {
    inner.stats.record_received();

    let env = match transport::decode(&raw) {
        Ok(env) => env,
        Err(error) => {
            tracing::warn!(%error, "dropping undecodable frame");
            inner.stats.record_invalid();
            return;
        }
    };

    let validation = validate(&env);
    if !validation.valid {
        tracing::warn!(errors = ?validation.errors, "dropping invalid inbound envelope");
        inner.stats.record_invalid();
        return;
    }
    for warning in &validation.warnings {
        tracing::debug!(id = %env.id, %warning, "inbound envelope warning");
    }

    let env = sanitize(env);
    let sender_id = env.sender().unwrap_or("anonymous").to_string();

    let (first_seen, cached) = inner.connections.touch(&sender_id);
    if first_seen {
        tracing::info!(sender_id = %sender_id, "new connection record");
    }
    for queued in cached {
        match transport::encode(&queued) {
            Ok(frame) => {
                if inner.transport.send(frame).await.is_ok() {
                    inner.stats.record_sent();
                    inner.connections.record_sent(&sender_id);
                }
            }
            Err(error) => tracing::warn!(%error, "cached push encode failed"),
        }
    }

    if matches!(env.kind, Kind::Request { .. }) {
        let request_snapshot = env.clone();
        let started = std::time::Instant::now();
        let outcome = inner.router.route(env).await;

        match &outcome {
            Ok(_) => inner
                .stats
                .record_success(&request_snapshot.msg_type, started.elapsed()),
            Err(_) => inner.stats.record_error(),
        }

        let response = sanitize(
            Envelope::response_to(&request_snapshot, outcome.map_err(|e| e.to_info()))
                .with_sender(&inner.cfg.server_id),
        );
        match transport::encode(&response) {
            Ok(frame) => {
                if inner.transport.send(frame).await.is_err() {
                    tracing::warn!(
                        request_id = %request_snapshot.id,
                        "response send failed; initiator will time out"
                    );
                } else {
                    inner.stats.record_sent();
                    inner.connections.record_sent(&sender_id);
                }
            }
            Err(error) => tracing::warn!(%error, "response encode failed"),
        }
    } else if matches!(env.kind, Kind::Push { .. }) {
        // Fire-and-forget: failures are logged, there is no one to tell.
        if let Err(error) = inner.router.route(env).await {
            tracing::warn!(%error, "push handler failed");
            inner.stats.record_error();
        }
    } else {
        // The responder owns no pending table; mirror the client's
        // unknown-correlation discipline.
        tracing::debug!(id = %env.id, "response-mode envelope at responder dropped");
    }
}

/// Built-in handlers for the SYSTEM_* vocabulary.
struct SystemService {
    connections: Arc<ConnectionRegistry>,
    stats: Arc<RuntimeStats>,
}

#[async_trait]
impl Handler for SystemService {
    fn name(&self) -> &str {
        "system"
    }

    fn accepts(&self) -> Vec<String> {
        system::ALL.iter().map(|t| t.to_string()).collect()
    }

    async fn handle(&self, env: &Envelope) -> Result<Option<Value>> {
        let sender_id = env.sender().unwrap_or("anonymous");
        match env.msg_type.as_str() {
            system::CONNECT => {
                // The registry entry already exists (touch precedes
                // routing); this is the readiness acknowledgement.
                Ok(Some(json!({
                    "connected": true,
                    "sender": sender_id,
                    "server_time_ms": now_ms(),
                })))
            }
            system::DISCONNECT => {
                let removed = self.connections.remove(sender_id);
                Ok(Some(json!({ "disconnected": removed })))
            }
            system::PING => Ok(Some(json!({ "pong": true, "time_ms": now_ms() }))),
            system::DEBUG_ENABLE => {
                let known = self.connections.set_debug(sender_id, true);
                Ok(Some(json!({ "debug": known })))
            }
            system::DEBUG_DISABLE => {
                self.connections.set_debug(sender_id, false);
                Ok(Some(json!({ "debug": false })))
            }
            system::STATUS => Ok(Some(json!({
                "stats": self.stats.snapshot(),
                "connections": self.connections.connected(),
            }))),
            other => Err(CrosswireError::HandlerNotFound(other.to_string())),
        }
    }
}
