//! End-to-end duplex scenarios over the in-memory transport.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use crosswire_core::protocol::retry::{Backoff, RetryPolicy};
use crosswire_core::protocol::{system, Envelope};
use crosswire_core::{CrosswireError, ErrorCode, Result};
use crosswire_runtime::client::{DuplexClient, PushOptions, RequestOptions};
use crosswire_runtime::config::{ClientSection, ServerSection};
use crosswire_runtime::dispatch::Handler;
use crosswire_runtime::server::{BroadcastOptions, DuplexServer};
use crosswire_runtime::transport::MemTransport;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn client_section(sender_id: &str) -> ClientSection {
    ClientSection {
        sender_id: Some(sender_id.to_string()),
        connect_timeout_ms: 2_000,
        epoch_check_interval_ms: 50,
        ..ClientSection::default()
    }
}

fn setup(sender_id: &str) -> (DuplexClient, DuplexServer, Arc<MemTransport>) {
    init_tracing();
    let (a, b) = MemTransport::pair();
    let client_transport = Arc::new(a);
    let client = DuplexClient::new(client_transport.clone(), client_section(sender_id));
    let server = DuplexServer::new(Arc::new(b), ServerSection::default());
    server.serve();
    (client, server, client_transport)
}

struct TaskHandler;

#[async_trait]
impl Handler for TaskHandler {
    fn name(&self) -> &str {
        "task"
    }
    fn accepts(&self) -> Vec<String> {
        vec!["TASK_SUBMIT".into()]
    }
    async fn handle(&self, _env: &Envelope) -> Result<Option<Value>> {
        Ok(Some(json!({ "accepted": true })))
    }
}

/// Fails with a retryable handler error on the first call, then succeeds.
struct FlakyHandler {
    calls: AtomicU32,
}

#[async_trait]
impl Handler for FlakyHandler {
    fn name(&self) -> &str {
        "flaky"
    }
    fn accepts(&self) -> Vec<String> {
        vec!["TASK_FLAKY".into()]
    }
    async fn handle(&self, _env: &Envelope) -> Result<Option<Value>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(CrosswireError::Handler {
                message: "transient".into(),
                retryable: true,
            })
        } else {
            Ok(Some(json!({ "attempt": 2 })))
        }
    }
}

#[tokio::test]
async fn calls_before_initialize_fail_fast() {
    let (client, _server, _t) = setup("tab-0");
    let err = client
        .request("TASK_SUBMIT", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotReady);

    let err = client
        .push("TASK_EVENT", "progress", None, PushOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotReady);
}

#[tokio::test]
async fn request_round_trip_resolves_with_payload() {
    let (client, server, _t) = setup("tab-1");
    server.register_handler(Arc::new(TaskHandler));
    client.initialize().await.unwrap();

    let before = client.stats().messages.success_messages;
    let out = client
        .request(
            "TASK_SUBMIT",
            Some(json!({"taskId": "t1"})),
            RequestOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out["accepted"], true);

    let after = client.stats().messages.success_messages;
    assert_eq!(after, before + 1);
    assert_eq!(client.stats().in_flight, 0);

    let perf = client.performance_metrics();
    assert!(perf.iter().any(|row| row.msg_type == "TASK_SUBMIT"));
}

#[tokio::test]
async fn missing_handler_surfaces_typed_remote_error() {
    let (client, _server, _t) = setup("tab-2");
    client.initialize().await.unwrap();

    let err = client
        .request("NOBODY_HOME", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::HandlerNotFound);
    assert!(!err.retryable());
}

#[tokio::test]
async fn invalid_outbound_request_raises_before_send() {
    let (client, _server, _t) = setup("tab-3");
    client.initialize().await.unwrap();

    let sent_before = client.stats().messages.messages_sent;
    let err = client
        .request(
            "TASK_SUBMIT",
            None,
            RequestOptions {
                timeout_ms: Some(10), // below the 1s floor
                ..RequestOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert_eq!(client.stats().messages.messages_sent, sent_before);
}

#[tokio::test]
async fn lost_frames_time_out_and_settle_once() {
    let (client, _server, transport) = setup("tab-4");
    client.initialize().await.unwrap();

    transport.set_lossy(true);
    let err = client
        .request(
            "TASK_SUBMIT",
            None,
            RequestOptions {
                timeout_ms: Some(1_000),
                ..RequestOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert_eq!(client.stats().in_flight, 0);
}

#[tokio::test]
async fn retry_recovers_from_transient_handler_failure() {
    let (client, server, _t) = setup("tab-5");
    let flaky = Arc::new(FlakyHandler {
        calls: AtomicU32::new(0),
    });
    server.register_handler(flaky.clone());
    client.initialize().await.unwrap();

    let out = client
        .request(
            "TASK_FLAKY",
            None,
            RequestOptions {
                retry: Some(RetryPolicy {
                    max_attempts: 3,
                    interval_ms: 100,
                    backoff: Backoff::Fixed,
                    multiplier: 1.0,
                    max_interval_ms: None,
                }),
                ..RequestOptions::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out["attempt"], 2);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pushes_reach_filtered_subscribers() {
    let (client, server, _t) = setup("tab-6");
    client.initialize().await.unwrap();

    let mut progress = client.on_push(Some("progress".into()));
    let mut all_messages = client.on_message(None);

    let delivered = server
        .push_to_client("tab-6", "TASK_EVENT", "progress", Some(json!({"pct": 50})))
        .await
        .unwrap();
    assert!(delivered);
    let delivered = server
        .push_to_client("tab-6", "TASK_EVENT", "done", None)
        .await
        .unwrap();
    assert!(delivered);

    let env = progress.recv().await.unwrap();
    assert_eq!(env.payload.unwrap()["pct"], 50);
    // The filtered stream never sees the "done" event.
    assert!(progress.try_recv().is_none());

    let first = all_messages.recv().await.unwrap();
    assert_eq!(first.msg_type, "TASK_EVENT");
}

#[tokio::test]
async fn client_push_is_routed_fire_and_forget() {
    let (client, server, _t) = setup("tab-7");

    struct Recorder {
        seen: Arc<AtomicU32>,
    }
    #[async_trait]
    impl Handler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn accepts(&self) -> Vec<String> {
            vec!["CHAT_EVENT".into()]
        }
        async fn handle(&self, env: &Envelope) -> Result<Option<Value>> {
            assert_eq!(env.sender(), Some("tab-7"));
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    let seen = Arc::new(AtomicU32::new(0));
    server.register_handler(Arc::new(Recorder { seen: seen.clone() }));
    client.initialize().await.unwrap();

    client
        .push(
            "CHAT_EVENT",
            "message",
            Some(json!({"text": "hi"})),
            PushOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broadcast_counts_and_honors_exclude() {
    let (client, server, _t) = setup("tab-8");
    client.initialize().await.unwrap();

    let delivered = server
        .broadcast("TASK_EVENT", "refresh", None, BroadcastOptions::default())
        .await;
    assert_eq!(delivered, 1);

    let delivered = server
        .broadcast(
            "TASK_EVENT",
            "refresh",
            None,
            BroadcastOptions {
                exclude: Some("tab-8".into()),
                ..BroadcastOptions::default()
            },
        )
        .await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn debug_flag_propagates_to_server_records() {
    let (client, server, _t) = setup("tab-9");
    client.initialize().await.unwrap();

    client.enable_debug().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let delivered = server
        .broadcast(
            "TASK_EVENT",
            "trace",
            None,
            BroadcastOptions {
                debug_only: true,
                ..BroadcastOptions::default()
            },
        )
        .await;
    assert_eq!(delivered, 1);

    client.disable_debug().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let delivered = server
        .broadcast(
            "TASK_EVENT",
            "trace",
            None,
            BroadcastOptions {
                debug_only: true,
                ..BroadcastOptions::default()
            },
        )
        .await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn system_ping_and_status_answer() {
    let (client, _server, _t) = setup("tab-10");
    client.initialize().await.unwrap();

    let pong = client
        .request(system::PING, None, RequestOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pong["pong"], true);

    let status = client
        .request(system::STATUS, None, RequestOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert!(status["connections"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["sender_id"] == "tab-10"));
}

#[tokio::test]
async fn endpoint_swap_triggers_reinitialize() {
    let (client, _server, transport) = setup("tab-11");
    client.initialize().await.unwrap();
    assert!(client.is_ready());

    transport.bump_epoch();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The client noticed the swap and re-ran the handshake.
    assert!(client.is_ready());
    let out = client
        .request(system::PING, None, RequestOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out["pong"], true);
}

#[tokio::test]
async fn destroy_cancels_in_flight_requests() {
    let (client, _server, transport) = setup("tab-12");
    client.initialize().await.unwrap();

    transport.set_lossy(true);
    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request(
                    "TASK_SUBMIT",
                    None,
                    RequestOptions {
                        timeout_ms: Some(30_000),
                        ..RequestOptions::default()
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.destroy().await;
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert!(!client.is_ready());
}
