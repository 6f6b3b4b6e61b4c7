//! Duplex client: the initiator-side façade.
//!
//! Owns the request manager and the demux loop. One loop receives every
//! inbound frame and fans it out: responses to the pending table, pushes to
//! the push subscribers, everything to the message subscribers. Readiness
//! is gated on a CONNECT handshake; calls made before that fail fast.

pub mod subscriptions;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crosswire_core::protocol::retry::{RetryPolicy, RetryPredicate};
use crosswire_core::protocol::{sanitize, system, validate, Envelope, Kind, Priority};
use crosswire_core::{CrosswireError, Result};

use crate::config::ClientSection;
use crate::pending::{execute_with_retry, RequestManager};
use crate::stats::{RuntimeStats, StatsSnapshot, TypePerfSnapshot};
use crate::transport::{self, Transport};

pub use subscriptions::{Subscription, SubscriptionRegistry};

/// Per-request knobs. The retry predicate is process-local and never
/// serialized.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeout_ms: Option<u64>,
    pub priority: Option<Priority>,
    pub retry: Option<RetryPolicy>,
    pub retry_predicate: Option<Arc<RetryPredicate>>,
}

#[derive(Clone, Debug, Default)]
pub struct PushOptions {
    pub priority: Option<Priority>,
    /// Unicast target sender id; absent = broadcast.
    pub target: Option<String>,
    /// Ask the responder to cache while the target is unreachable.
    pub persistent: bool,
}

/// Client-side stats dump.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    #[serde(flatten)]
    pub messages: StatsSnapshot,
    pub in_flight: usize,
    pub ready: bool,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    manager: RequestManager,
    cfg: ClientSection,
    sender_id: String,
    ready: AtomicBool,
    debug: AtomicBool,
    stats: Arc<RuntimeStats>,
    pushes: Arc<SubscriptionRegistry>,
    messages: Arc<SubscriptionRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Initiator-side façade over the channel.
#[derive(Clone)]
pub struct DuplexClient {
    inner: Arc<ClientInner>,
}

impl DuplexClient {
    pub fn new(transport: Arc<dyn Transport>, cfg: ClientSection) -> Self {
        let sender_id = cfg
            .sender_id
            .clone()
            .unwrap_or_else(|| format!("ctx-{}", Uuid::new_v4()));
        let stats = Arc::new(RuntimeStats::default());
        let manager = RequestManager::new(
            Arc::clone(&transport),
            Arc::clone(&stats),
            cfg.max_in_flight,
        );
        let depth = cfg.subscriber_depth;
        Self {
            inner: Arc::new(ClientInner {
                transport,
                manager,
                cfg,
                sender_id,
                ready: AtomicBool::new(false),
                debug: AtomicBool::new(false),
                stats,
                pushes: Arc::new(SubscriptionRegistry::new(depth)),
                messages: Arc::new(SubscriptionRegistry::new(depth)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Verify the remote side is reachable and flip to ready.
    ///
    /// Spawns the demux loop on first call, then performs the CONNECT
    /// handshake through the ordinary request path. Idempotent once ready.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(inbox) = self.inner.transport.take_inbox() {
            let handle = tokio::spawn(demux_loop(Arc::clone(&self.inner), inbox));
            if let Ok(mut tasks) = self.inner.tasks.lock() {
                tasks.push(handle);
            }
        }
        connect(&self.inner).await?;
        self.inner.ready.store(true, Ordering::SeqCst);
        tracing::info!(sender_id = %self.inner.sender_id, "duplex client ready");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn sender_id(&self) -> &str {
        &self.inner.sender_id
    }

    /// Correlated call: send a request, await its response payload.
    ///
    /// Outbound validation failures raise here, before anything is sent.
    /// With a retry policy set, failed attempts are retried serially with
    /// the computed backoff; each attempt is a fresh envelope.
    pub async fn request(
        &self,
        msg_type: impl Into<String>,
        data: Option<Value>,
        options: RequestOptions,
    ) -> Result<Option<Value>> {
        if !self.inner.ready.load(Ordering::SeqCst) {
            return Err(CrosswireError::NotReady);
        }
        let msg_type = msg_type.into();
        match options.retry.clone() {
            Some(policy) => {
                let predicate = options.retry_predicate.clone();
                execute_with_retry(&policy, predicate.as_deref(), |_attempt| {
                    let env = self.build_request(&msg_type, data.clone(), &options);
                    async move {
                        match env {
                            Ok(env) => self.inner.manager.send_request(env).await,
                            Err(e) => Err(e),
                        }
                    }
                })
                .await
            }
            None => {
                let env = self.build_request(&msg_type, data.clone(), &options)?;
                self.inner.manager.send_request(env).await
            }
        }
    }

    /// Fire-and-forget push: no correlation bookkeeping, no timer.
    pub async fn push(
        &self,
        msg_type: impl Into<String>,
        event_type: impl Into<String>,
        data: Option<Value>,
        options: PushOptions,
    ) -> Result<()> {
        if !self.inner.ready.load(Ordering::SeqCst) {
            return Err(CrosswireError::NotReady);
        }
        let mut env =
            Envelope::push(msg_type, event_type, data).with_sender(&self.inner.sender_id);
        if let Some(priority) = options.priority {
            env = env.with_priority(priority);
        }
        if let Some(target) = options.target {
            env = env.with_target(target);
        }
        if options.persistent {
            env = env.persistent();
        }
        let env = sanitize(env);
        let validation = validate(&env);
        if !validation.valid {
            return Err(CrosswireError::Validation(validation.errors.join("; ")));
        }
        let frame = transport::encode(&env)?;
        self.inner.transport.send(frame).await?;
        self.inner.stats.record_sent();
        Ok(())
    }

    /// Live stream of incoming pushes, optionally filtered by event type.
    pub fn on_push(&self, event_type: Option<String>) -> Subscription {
        self.inner.pushes.subscribe(event_type)
    }

    /// Live stream of every incoming envelope, optionally filtered by
    /// message type.
    pub fn on_message(&self, msg_type: Option<String>) -> Subscription {
        self.inner.messages.subscribe(msg_type)
    }

    /// Turn on envelope-level tracing locally and tell the remote side to
    /// tag its outbound traffic too.
    pub async fn enable_debug(&self) -> Result<()> {
        self.inner.debug.store(true, Ordering::Relaxed);
        self.push(system::DEBUG_ENABLE, "debug", None, PushOptions::default())
            .await
    }

    pub async fn disable_debug(&self) -> Result<()> {
        self.inner.debug.store(false, Ordering::Relaxed);
        self.push(system::DEBUG_DISABLE, "debug", None, PushOptions::default())
            .await
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            messages: self.inner.stats.snapshot(),
            in_flight: self.inner.manager.in_flight(),
            ready: self.is_ready(),
        }
    }

    /// Average round-trip time per message type.
    pub fn performance_metrics(&self) -> Vec<TypePerfSnapshot> {
        self.inner.stats.performance()
    }

    /// Teardown: force-reject outstanding requests, stop the demux loop,
    /// and drop every subscriber.
    pub async fn destroy(&self) {
        self.inner.ready.store(false, Ordering::SeqCst);
        let cancelled = self.inner.manager.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled in-flight requests on destroy");
        }
        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        self.inner.pushes.clear();
        self.inner.messages.clear();
    }

    fn build_request(
        &self,
        msg_type: &str,
        data: Option<Value>,
        options: &RequestOptions,
    ) -> Result<Envelope> {
        let mut env = Envelope::request(msg_type, data)
            .with_sender(&self.inner.sender_id)
            .with_timeout(
                options
                    .timeout_ms
                    .unwrap_or(self.inner.cfg.default_timeout_ms),
            );
        if let Some(priority) = options.priority {
            env = env.with_priority(priority);
        }
        if let Some(retry) = &options.retry {
            env = env.with_retry(retry.clone());
        }
        let env = sanitize(env);
        let validation = validate(&env);
        if !validation.valid {
            return Err(CrosswireError::Validation(validation.errors.join("; ")));
        }
        Ok(env)
    }
}

/// CONNECT handshake through the ordinary request path. Internal envelopes
/// skip the public validation gate; the short connect timeout may sit below
/// the caller-facing minimum.
async fn connect(inner: &Arc<ClientInner>) -> Result<()> {
    let env = Envelope::request(
        system::CONNECT,
        Some(json!({
            "sender": inner.sender_id.clone(),
            "debug": inner.debug.load(Ordering::Relaxed),
        })),
    )
    .with_sender(&inner.sender_id)
    .with_timeout(inner.cfg.connect_timeout_ms);

    inner.manager.send_request(env).await.map(|_| ())
}

/// One loop owns the inbound queue; everything else coordinates through
/// the pending table and subscription registries.
async fn demux_loop(inner: Arc<ClientInner>, mut inbox: mpsc::Receiver<Bytes>) {
    let mut cleanup =
        tokio::time::interval(Duration::from_millis(inner.cfg.cleanup_interval_ms));
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut epoch_tick =
        tokio::time::interval(Duration::from_millis(inner.cfg.epoch_check_interval_ms));
    epoch_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_epoch = inner.transport.endpoint_epoch();

    loop {
        tokio::select! {
            maybe = inbox.recv() => {
                let Some(frame) = maybe else {
                    tracing::warn!("inbound channel closed; client no longer receiving");
                    inner.ready.store(false, Ordering::SeqCst);
                    break;
                };
                handle_frame(&inner, frame);
            }

            _ = cleanup.tick() => {
                inner
                    .manager
                    .cleanup_expired(Duration::from_millis(inner.cfg.request_ceiling_ms));
            }

            _ = epoch_tick.tick() => {
                let epoch = inner.transport.endpoint_epoch();
                if epoch != last_epoch {
                    last_epoch = epoch;
                    tracing::warn!(epoch, "remote endpoint changed, reinitializing");
                    inner.ready.store(false, Ordering::SeqCst);
                    // In-flight requests from before the swap are left to
                    // their own timeouts.
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        match connect(&inner).await {
                            Ok(()) => {
                                inner.ready.store(true, Ordering::SeqCst);
                                tracing::info!("reconnected to replaced endpoint");
                            }
                            Err(error) => {
                                tracing::warn!(%error, "reconnect handshake failed");
                            }
                        }
                    });
                }
            }
        }
    }
}

fn handle_frame(inner: &Arc<ClientInner>, frame: Bytes) {
    inner.stats.record_received();

    let env = match transport::decode(&frame) {
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
    if inner.debug.load(Ordering::Relaxed) {
        tracing::debug!(id = %env.id, msg_type = %env.msg_type, "inbound envelope");
    }

    inner.messages.publish(&env.msg_type, &env);

    if let Kind::Push {
        event_type, target, ..
    } = &env.kind
    {
        if let Some(target) = target {
            if target != &inner.sender_id {
                tracing::trace!(%target, "push for another target ignored");
                return;
            }
        }
        let key = event_type.clone();
        inner.pushes.publish(&key, &env);
        return;
    }

    if matches!(env.kind, Kind::Response { .. }) {
        inner.manager.handle_response(env);
    } else {
        // The initiator routes nothing; surfaced to subscribers only.
        tracing::debug!(id = %env.id, "request-mode envelope at initiator");
    }
}
