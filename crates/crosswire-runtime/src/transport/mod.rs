//! Transport seam and frame codec.
//!
//! The channel primitive is supplied by the embedding application. Its
//! contract is deliberately weak: opaque frames, best-effort delivery,
//! at-most-once per send, no ordering between frames, no notification when
//! the remote side disappears. Correlation and timeouts are the runtime's
//! job, never the transport's.

pub mod mem;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crosswire_core::protocol::Envelope;
use crosswire_core::{CrosswireError, Result};

pub use mem::MemTransport;

/// One side of a best-effort frame channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to the other side. At-most-once; an `Ok` does not
    /// mean the frame arrived.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Take ownership of the inbound frame queue. Only the demux loop may
    /// receive; subsequent calls return `None`.
    fn take_inbox(&self) -> Option<mpsc::Receiver<Bytes>>;

    /// Monotonic counter that bumps when the remote endpoint identity
    /// changes (e.g. the worker was replaced). Watched by the client to
    /// trigger re-initialization.
    fn endpoint_epoch(&self) -> u64;
}

/// Serialize an envelope into a wire frame.
pub fn encode(env: &Envelope) -> Result<Bytes> {
    let v = serde_json::to_vec(env)
        .map_err(|e| CrosswireError::InvalidMessage(format!("encode failed: {e}")))?;
    Ok(Bytes::from(v))
}

/// Decode a wire frame once, before policy or routing see it.
pub fn decode(frame: &Bytes) -> Result<Envelope> {
    serde_json::from_slice(frame)
        .map_err(|e| CrosswireError::InvalidMessage(format!("invalid envelope json: {e}")))
}
