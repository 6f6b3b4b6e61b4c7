//! Envelope validation, sanitization, and payload redaction.
//!
//! Failure policy: inbound envelopes that fail validation are dropped by the
//! caller with a warning; outbound envelopes that fail validation raise
//! synchronously before anything is sent. Validation itself never errors;
//! it reports.

use serde_json::Value;

use super::envelope::{now_ms, Envelope, Kind};

/// Allowed request timeout range, milliseconds.
pub const TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u64> = 1_000..=300_000;
/// Allowed retry interval range, milliseconds.
pub const INTERVAL_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=60_000;
/// Default request timeout applied by `sanitize`.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Timestamps older than this are flagged as stale (warning only).
const STALE_AFTER_MS: u64 = 3_600_000;

/// Replacement marker for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Key-name fragments that mark a value as sensitive (matched
/// case-insensitively as substrings).
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "token",
    "secret",
    "password",
    "key",
    "apikey",
    "api_key",
    "credential",
    "auth",
];

/// Validation outcome. `errors` fail the envelope; `warnings` do not.
#[derive(Debug, Default)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Structural validation: required fields per mode, numeric ranges,
/// timestamp sanity.
pub fn validate(env: &Envelope) -> Validation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if env.id.is_empty() {
        errors.push("id must not be empty".into());
    }
    if env.msg_type.is_empty() {
        errors.push("type must not be empty".into());
    }

    match &env.kind {
        Kind::Request {
            timeout_ms, retry, ..
        } => {
            if let Some(t) = timeout_ms {
                if !TIMEOUT_RANGE_MS.contains(t) {
                    errors.push(format!(
                        "timeout_ms {t} outside {}..={}",
                        TIMEOUT_RANGE_MS.start(),
                        TIMEOUT_RANGE_MS.end()
                    ));
                }
            }
            if let Some(r) = retry {
                if r.max_attempts < 1 {
                    errors.push("retry.max_attempts must be >= 1".into());
                }
                if !INTERVAL_RANGE_MS.contains(&r.interval_ms) {
                    errors.push(format!(
                        "retry.interval_ms {} outside {}..={}",
                        r.interval_ms,
                        INTERVAL_RANGE_MS.start(),
                        INTERVAL_RANGE_MS.end()
                    ));
                }
            }
        }
        Kind::Response {
            request_id, status, error, ..
        } => {
            if request_id.is_empty() {
                errors.push("response requires request_id".into());
            }
            if *status == super::envelope::Status::Error && error.is_none() {
                warnings.push("error response carries no error info".into());
            }
        }
        Kind::Push { event_type, .. } => {
            if event_type.is_empty() {
                errors.push("push requires event_type".into());
            }
        }
    }

    let now = now_ms();
    if env.timestamp_ms > now {
        warnings.push("timestamp is in the future".into());
    } else if env.timestamp_ms != 0 && now - env.timestamp_ms > STALE_AFTER_MS {
        warnings.push("timestamp is more than 1h stale".into());
    }

    Validation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Normalize optional fields to defaults and redact the payload.
///
/// - absent/implausible timestamp -> now
/// - request without timeout -> 30s default
/// - payload -> redacted copy
/// - metadata that ends up empty is stripped
pub fn sanitize(mut env: Envelope) -> Envelope {
    let now = now_ms();
    if env.timestamp_ms == 0 || env.timestamp_ms > now {
        env.timestamp_ms = now;
    }

    if let Kind::Request { timeout_ms, .. } = &mut env.kind {
        if timeout_ms.is_none() {
            *timeout_ms = Some(DEFAULT_TIMEOUT_MS);
        }
    }

    if let Some(payload) = env.payload.take() {
        env.payload = Some(strip_empty(redact(payload)));
    }

    if let Some(meta) = &env.metadata {
        if meta.is_empty() {
            env.metadata = None;
        }
    }

    env
}

/// Recursively replace sensitive values with [`REDACTED`].
///
/// A value is sensitive if its key matches a sensitive-name fragment, or if
/// the string itself looks like a bearer credential regardless of key name.
/// Payloads may be captured for diagnostics; they must never leak
/// credentials.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted = map
                .into_iter()
                .map(|(k, v)| {
                    if is_sensitive_key(&k) {
                        tracing::trace!(key = %k, "redacted sensitive field");
                        (k, Value::String(REDACTED.into()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        Value::String(s) if looks_like_credential(&s) => {
            tracing::trace!("redacted credential-shaped string");
            Value::String(REDACTED.into())
        }
        other => other,
    }
}

/// Drop object keys whose values are null or empty strings.
fn strip_empty(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !matches!(v, Value::Null) && v.as_str() != Some(""))
                .map(|(k, v)| (k, strip_empty(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_empty).collect()),
        other => other,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|frag| lower.contains(frag))
}

/// Long opaque strings that look like bearer credentials: known prefixes, or
/// a long unbroken base64-ish run.
fn looks_like_credential(s: &str) -> bool {
    if s.len() >= 20 && (s.starts_with("sk-") || s.starts_with("Bearer ") || s.starts_with("eyJ")) {
        return true;
    }
    s.len() >= 32
        && !s.contains(' ')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_'))
}
