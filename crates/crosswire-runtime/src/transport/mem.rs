//! In-process transport pair.
//!
//! Two `MemTransport` halves connected by bounded mpsc queues. Used by
//! tests and by embedders that run both contexts in one process. Supports
//! loss injection (frames silently dropped) and endpoint-epoch bumps to
//! exercise the client's reconnect path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crosswire_core::{CrosswireError, Result};

use super::Transport;

const DEFAULT_QUEUE_DEPTH: usize = 1024;

pub struct MemTransport {
    tx: mpsc::Sender<Bytes>,
    inbox: Mutex<Option<mpsc::Receiver<Bytes>>>,
    epoch: AtomicU64,
    lossy: AtomicBool,
    dropped: AtomicU64,
}

impl MemTransport {
    /// Create a connected pair of transport halves.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn pair_with_depth(depth: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(depth);
        let (b_tx, a_rx) = mpsc::channel(depth);
        (Self::half(a_tx, a_rx), Self::half(b_tx, b_rx))
    }

    fn half(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            tx,
            inbox: Mutex::new(Some(rx)),
            epoch: AtomicU64::new(0),
            lossy: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// While set, every outgoing frame is silently dropped.
    pub fn set_lossy(&self, lossy: bool) {
        self.lossy.store(lossy, Ordering::Relaxed);
    }

    /// Frames dropped by loss injection so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Simulate the remote endpoint being replaced.
    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.lossy.load(Ordering::Relaxed) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| CrosswireError::ConnectionLost)
    }

    fn take_inbox(&self) -> Option<mpsc::Receiver<Bytes>> {
        match self.inbox.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        }
    }

    fn endpoint_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_between_halves() {
        let (a, b) = MemTransport::pair();
        let mut b_rx = b.take_inbox().unwrap();
        a.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn inbox_can_only_be_taken_once() {
        let (a, _b) = MemTransport::pair();
        assert!(a.take_inbox().is_some());
        assert!(a.take_inbox().is_none());
    }

    #[tokio::test]
    async fn lossy_mode_drops_silently() {
        let (a, b) = MemTransport::pair();
        let mut b_rx = b.take_inbox().unwrap();
        a.set_lossy(true);
        a.send(Bytes::from_static(b"gone")).await.unwrap();
        assert_eq!(a.dropped(), 1);
        a.set_lossy(false);
        a.send(Bytes::from_static(b"kept")).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"kept"));
    }
}
