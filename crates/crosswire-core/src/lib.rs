//! crosswire core: transport-agnostic protocol primitives and error types.
//!
//! This crate defines the envelope model, retry policy, validation and
//! redaction rules, and the error surface shared by the duplex client and
//! server runtimes. It intentionally carries no transport or runtime
//! dependencies so it can be reused in multiple contexts.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! All fallible paths must surface as `CrosswireError`/`Result` so a
//! receiving loop never crashes on malformed traffic.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod protocol;

/// Shared result type.
pub use error::{CrosswireError, ErrorCode, Result};
