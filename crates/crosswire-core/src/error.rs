//! Shared error type across crosswire crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::envelope::ErrorInfo;

/// Wire-facing error codes (stable API).
///
/// These are the codes carried inside `ErrorInfo` on error responses and
/// surfaced to callers. Retryability defaults follow `default_retryable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed envelope (failed decode or missing required fields).
    InvalidMessage,
    /// Envelope failed semantic validation before send.
    ValidationError,
    /// No response within the request deadline.
    Timeout,
    /// The underlying channel went away mid-flight.
    ConnectionLost,
    /// Transport-level send failure.
    NetworkError,
    /// Remote side is up but refusing work.
    ServiceUnavailable,
    /// No registered handler accepts the message type.
    HandlerNotFound,
    /// A handler ran and failed.
    HandlerError,
    /// Too many requests in a window.
    RateLimitExceeded,
    /// A quota was exhausted.
    QuotaExceeded,
    /// Caller is not authenticated.
    Unauthorized,
    /// Caller is authenticated but not allowed.
    Forbidden,
    /// The initiator-side in-flight cap was hit.
    ConcurrencyLimit,
    /// The pending request was cancelled locally.
    Cancelled,
    /// Call made before `initialize()` completed.
    NotReady,
    /// Anything else.
    #[serde(other)]
    Internal,
}

impl ErrorCode {
    /// String representation used in JSON error payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::HandlerNotFound => "HANDLER_NOT_FOUND",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::ConcurrencyLimit => "CONCURRENCY_LIMIT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::NotReady => "NOT_READY",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether a failure with this code is worth retrying absent a
    /// caller-supplied predicate.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::ConnectionLost
                | ErrorCode::NetworkError
                | ErrorCode::ServiceUnavailable
        )
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, CrosswireError>;

/// Unified error type used by core and the duplex runtime.
#[derive(Debug, Error)]
pub enum CrosswireError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("connection lost")]
    ConnectionLost,
    #[error("network error: {0}")]
    Network(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("no handler for message type: {0}")]
    HandlerNotFound(String),
    #[error("handler error: {message}")]
    Handler { message: String, retryable: bool },
    #[error("in-flight request cap reached ({in_flight}/{cap})")]
    ConcurrencyLimit { in_flight: usize, cap: usize },
    #[error("request cancelled: {0}")]
    Cancelled(String),
    #[error("runtime not initialized")]
    NotReady,
    #[error("remote error: {}: {}", .0.code.as_str(), .0.message)]
    Remote(ErrorInfo),
    #[error("internal: {0}")]
    Internal(String),
}

impl CrosswireError {
    /// Map internal error to a stable wire-facing code.
    pub fn code(&self) -> ErrorCode {
        match self {
            CrosswireError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            CrosswireError::Validation(_) => ErrorCode::ValidationError,
            CrosswireError::Timeout(_) => ErrorCode::Timeout,
            CrosswireError::ConnectionLost => ErrorCode::ConnectionLost,
            CrosswireError::Network(_) => ErrorCode::NetworkError,
            CrosswireError::Unavailable(_) => ErrorCode::ServiceUnavailable,
            CrosswireError::HandlerNotFound(_) => ErrorCode::HandlerNotFound,
            CrosswireError::Handler { .. } => ErrorCode::HandlerError,
            CrosswireError::ConcurrencyLimit { .. } => ErrorCode::ConcurrencyLimit,
            CrosswireError::Cancelled(_) => ErrorCode::Cancelled,
            CrosswireError::NotReady => ErrorCode::NotReady,
            CrosswireError::Remote(info) => info.code,
            CrosswireError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether retrying this failure could plausibly succeed.
    ///
    /// Handler errors carry their own flag; remote errors honor the flag the
    /// responder set; everything else falls back to the per-code default.
    pub fn retryable(&self) -> bool {
        match self {
            CrosswireError::Handler { retryable, .. } => *retryable,
            CrosswireError::Remote(info) => info.retryable || info.code.default_retryable(),
            other => other.code().default_retryable(),
        }
    }

    /// Convert into the wire-facing `ErrorInfo` carried on error responses.
    pub fn to_info(&self) -> ErrorInfo {
        match self {
            CrosswireError::Remote(info) => info.clone(),
            other => ErrorInfo {
                code: other.code(),
                message: other.to_string(),
                details: None,
                context: None,
                retryable: other.retryable(),
            },
        }
    }
}
