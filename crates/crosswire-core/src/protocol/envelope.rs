//! Envelope model (JSON wire shape).
//!
//! One envelope is one unit exchanged over the channel. The mode-specific
//! fields live in [`Kind`], an internally tagged union flattened into the
//! base struct: the wire stays a flat JSON object with a `mode`
//! discriminator while the Rust side gets exhaustive matching, and a new
//! mode cannot silently fall through a dispatch site.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Delivery priority. Ordinal: higher preempts lower where queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Response outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Structured error carried on error responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Free-form origin context (e.g. a captured stack summary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

/// Optional envelope metadata: sender identity, free-form tags, and the
/// causal route trail (ids of the envelopes this one descends from).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<String>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.sender.is_none() && self.tags.is_empty() && self.route.is_empty()
    }
}

/// Mode-specific envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum Kind {
    #[serde(rename = "REQUEST")]
    Request {
        /// Response deadline in milliseconds. Defaulted by `sanitize`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<super::retry::RetryPolicy>,
        #[serde(default)]
        requires_ack: bool,
    },
    #[serde(rename = "RESPONSE")]
    Response {
        /// Correlation key: the id of the originating request.
        request_id: String,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    #[serde(rename = "PUSH")]
    Push {
        /// Sub-topic within the message type.
        event_type: String,
        /// Unicast target sender id. Absent = broadcast.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        /// Cache for the target while it is unreachable.
        #[serde(default)]
        persistent: bool,
    },
}

/// One message unit exchanged over the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique id (opaque string).
    pub id: String,
    /// Routing discriminator (field name is `type` in JSON).
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(flatten)]
    pub kind: Kind,
    /// Creation time, unix epoch milliseconds.
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Current wall-clock time in unix epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn next_id() -> String {
    Uuid::new_v4().to_string()
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(msg_type: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            id: next_id(),
            msg_type: msg_type.into(),
            kind: Kind::Request {
                timeout_ms: None,
                retry: None,
                requires_ack: false,
            },
            timestamp_ms: now_ms(),
            priority: Priority::Normal,
            payload,
            metadata: None,
        }
    }

    /// Build the response to `request`, carrying its id as the correlation
    /// key and extending its causal route trail.
    pub fn response_to(
        request: &Envelope,
        result: Result<Option<Value>, ErrorInfo>,
    ) -> Self {
        let mut route = request
            .metadata
            .as_ref()
            .map(|m| m.route.clone())
            .unwrap_or_default();
        route.push(request.id.clone());

        let (status, error, payload) = match result {
            Ok(payload) => (Status::Success, None, payload),
            Err(info) => (Status::Error, Some(info), None),
        };

        Self {
            id: next_id(),
            msg_type: request.msg_type.clone(),
            kind: Kind::Response {
                request_id: request.id.clone(),
                status,
                error,
            },
            timestamp_ms: now_ms(),
            priority: request.priority,
            payload,
            metadata: Some(Metadata {
                sender: None,
                tags: Vec::new(),
                route,
            }),
        }
    }

    /// Build a push envelope. `target = None` means broadcast.
    pub fn push(
        msg_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            id: next_id(),
            msg_type: msg_type.into(),
            kind: Kind::Push {
                event_type: event_type.into(),
                target: None,
                persistent: false,
            },
            timestamp_ms: now_ms(),
            priority: Priority::Normal,
            payload,
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::default)
            .sender = Some(sender.into());
        self
    }

    /// Set the response deadline. No effect on non-request envelopes.
    pub fn with_timeout(mut self, ms: u64) -> Self {
        if let Kind::Request { timeout_ms, .. } = &mut self.kind {
            *timeout_ms = Some(ms);
        }
        self
    }

    /// Attach a retry policy. No effect on non-request envelopes.
    pub fn with_retry(mut self, policy: super::retry::RetryPolicy) -> Self {
        if let Kind::Request { retry, .. } = &mut self.kind {
            *retry = Some(policy);
        }
        self
    }

    /// Set the unicast target. No effect on non-push envelopes.
    pub fn with_target(mut self, sender_id: impl Into<String>) -> Self {
        if let Kind::Push { target, .. } = &mut self.kind {
            *target = Some(sender_id.into());
        }
        self
    }

    /// Mark a push as cacheable while its target is unreachable.
    pub fn persistent(mut self) -> Self {
        if let Kind::Push { persistent, .. } = &mut self.kind {
            *persistent = true;
        }
        self
    }

    /// Sender identity from metadata, if any.
    pub fn sender(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.sender.as_deref())
    }

    /// Top-level category of the message type: the prefix before the first
    /// underscore (`SYSTEM_PING` -> `SYSTEM`). Used for stat bucketing.
    pub fn category(&self) -> &str {
        self.msg_type
            .split_once('_')
            .map(|(head, _)| head)
            .unwrap_or(self.msg_type.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_is_ordinal() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn request_serializes_flat_with_mode_tag() {
        let env = Envelope::request("TASK_SUBMIT", Some(json!({"taskId": "t1"})));
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["mode"], "REQUEST");
        assert_eq!(v["type"], "TASK_SUBMIT");
        assert_eq!(v["payload"]["taskId"], "t1");
        assert!(v.get("request_id").is_none());
    }

    #[test]
    fn response_carries_correlation_and_route_trail() {
        let req = Envelope::request("TASK_SUBMIT", None).with_sender("tab-1");
        let resp = Envelope::response_to(&req, Ok(Some(json!({"accepted": true}))));

        match &resp.kind {
            Kind::Response {
                request_id, status, ..
            } => {
                assert_eq!(request_id, &req.id);
                assert_eq!(*status, Status::Success);
            }
            other => panic!("expected response kind, got {other:?}"),
        }
        let route = &resp.metadata.as_ref().unwrap().route;
        assert_eq!(route.as_slice(), [req.id.clone()]);
    }

    #[test]
    fn error_response_round_trips() {
        let req = Envelope::request("TASK_SUBMIT", None);
        let info = ErrorInfo {
            code: ErrorCode::HandlerNotFound,
            message: "no handler".into(),
            details: None,
            context: None,
            retryable: false,
        };
        let resp = Envelope::response_to(&req, Err(info));
        let s = serde_json::to_string(&resp).unwrap();
        let back: Envelope = serde_json::from_str(&s).unwrap();
        match back.kind {
            Kind::Response { status, error, .. } => {
                assert_eq!(status, Status::Error);
                assert_eq!(error.unwrap().code, ErrorCode::HandlerNotFound);
            }
            other => panic!("expected response kind, got {other:?}"),
        }
    }

    #[test]
    fn push_defaults_to_broadcast() {
        let env = Envelope::push("CHAT_EVENT", "message", None);
        match &env.kind {
            Kind::Push {
                target, persistent, ..
            } => {
                assert!(target.is_none());
                assert!(!persistent);
            }
            other => panic!("expected push kind, got {other:?}"),
        }
    }

    #[test]
    fn ids_are_unique() {
        let a = Envelope::request("X", None);
        let b = Envelope::request("X", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn category_is_prefix_before_underscore() {
        assert_eq!(Envelope::request("SYSTEM_PING", None).category(), "SYSTEM");
        assert_eq!(Envelope::request("TASK_SUBMIT", None).category(), "TASK");
        assert_eq!(Envelope::request("ping", None).category(), "ping");
    }
}
