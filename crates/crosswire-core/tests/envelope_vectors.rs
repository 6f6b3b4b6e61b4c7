//! Envelope vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;

use crosswire_core::protocol::{sanitize, validate, Backoff, Envelope, Kind, Priority, Status};
use crosswire_core::ErrorCode;

fn load(name: &str) -> String {
    fs::read_to_string(format!("tests/vectors/{name}")).unwrap()
}

#[test]
fn parse_request_min() {
    let s = load("request_min.json");
    let env: Envelope = serde_json::from_str(&s).unwrap();
    assert_eq!(env.id, "req-1");
    assert_eq!(env.msg_type, "SYSTEM_PING");
    assert_eq!(env.priority, Priority::Normal);
    assert!(env.payload.is_none());
    match env.kind {
        Kind::Request {
            timeout_ms,
            retry,
            requires_ack,
        } => {
            assert!(timeout_ms.is_none());
            assert!(retry.is_none());
            assert!(!requires_ack);
        }
        other => panic!("expected request, got {other:?}"),
    }
}

#[test]
fn parse_request_full() {
    let s = load("request_full.json");
    let env: Envelope = serde_json::from_str(&s).unwrap();
    assert_eq!(env.priority, Priority::High);
    assert_eq!(env.sender(), Some("tab-42"));
    match env.kind {
        Kind::Request {
            timeout_ms, retry, ..
        } => {
            assert_eq!(timeout_ms, Some(15_000));
            let retry = retry.unwrap();
            assert_eq!(retry.max_attempts, 5);
            assert_eq!(retry.backoff, Backoff::Exponential);
            assert_eq!(retry.max_interval_ms, Some(8_000));
        }
        other => panic!("expected request, got {other:?}"),
    }
}

#[test]
fn parse_response_error() {
    let s = load("response_error.json");
    let env: Envelope = serde_json::from_str(&s).unwrap();
    match env.kind {
        Kind::Response {
            request_id,
            status,
            error,
        } => {
            assert_eq!(request_id, "req-2");
            assert_eq!(status, Status::Error);
            let error = error.unwrap();
            assert_eq!(error.code, ErrorCode::ServiceUnavailable);
            assert!(error.retryable);
        }
        other => panic!("expected response, got {other:?}"),
    }
}

#[test]
fn parse_push_targeted() {
    let s = load("push_targeted.json");
    let env: Envelope = serde_json::from_str(&s).unwrap();
    assert_eq!(env.priority, Priority::Urgent);
    match env.kind {
        Kind::Push {
            event_type,
            target,
            persistent,
        } => {
            assert_eq!(event_type, "message");
            assert_eq!(target.as_deref(), Some("tab-42"));
            assert!(persistent);
        }
        other => panic!("expected push, got {other:?}"),
    }
}

/// sanitize + serialize + deserialize reproduces the envelope field-for-field.
#[test]
fn sanitized_envelope_round_trips() {
    let s = load("request_full.json");
    let env: Envelope = serde_json::from_str(&s).unwrap();
    let env = sanitize(env);
    assert!(validate(&env).valid);

    let wire = serde_json::to_string(&env).unwrap();
    let back: Envelope = serde_json::from_str(&wire).unwrap();

    assert_eq!(back.id, env.id);
    assert_eq!(back.msg_type, env.msg_type);
    assert_eq!(back.timestamp_ms, env.timestamp_ms);
    assert_eq!(back.priority, env.priority);
    assert_eq!(
        serde_json::to_value(&back.kind).unwrap(),
        serde_json::to_value(&env.kind).unwrap()
    );
    assert_eq!(back.payload, env.payload);
    assert_eq!(
        serde_json::to_value(&back.metadata).unwrap(),
        serde_json::to_value(&env.metadata).unwrap()
    );
}

/// An unknown mode string must fail to parse rather than fall through.
#[test]
fn unknown_mode_is_rejected() {
    let s = r#"{"id":"x","type":"X","mode":"GOSSIP"}"#;
    let err = serde_json::from_str::<Envelope>(s).unwrap_err();
    assert!(err.to_string().contains("GOSSIP") || err.to_string().contains("variant"));
}
