//! Middleware chain pieces.
//!
//! Middleware runs in registration order before a handler is selected; each
//! stage may transform the envelope or error out to abort routing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crosswire_core::protocol::Envelope;
use crosswire_core::{CrosswireError, Result};

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;
    async fn call(&self, env: Envelope) -> Result<Envelope>;
}

/// Rejects envelopes missing the fields routing depends on.
pub struct ValidationMiddleware;

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    async fn call(&self, env: Envelope) -> Result<Envelope> {
        if env.id.is_empty() {
            return Err(CrosswireError::Validation("envelope id missing".into()));
        }
        if env.msg_type.is_empty() {
            return Err(CrosswireError::Validation("envelope type missing".into()));
        }
        Ok(env)
    }
}

/// Traces every routed envelope while the shared debug flag is on.
pub struct LoggingMiddleware {
    enabled: Arc<AtomicBool>,
}

impl LoggingMiddleware {
    pub fn new(enabled: Arc<AtomicBool>) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn call(&self, env: Envelope) -> Result<Envelope> {
        if self.enabled.load(Ordering::Relaxed) {
            tracing::debug!(
                id = %env.id,
                msg_type = %env.msg_type,
                sender = env.sender().unwrap_or("-"),
                "routing envelope"
            );
        }
        Ok(env)
    }
}
