//! crosswire runtime library entry.
//!
//! This crate wires the transport seam, request manager, router, and the
//! duplex client/server façades into a cohesive messaging runtime. It is
//! intended to be consumed by embedding applications and by integration
//! tests; every piece is an explicit instance rather than a process
//! singleton, so tests can run multiple independent runtimes concurrently.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod fallback;
pub mod pending;
pub mod server;
pub mod stats;
pub mod transport;

pub use client::{DuplexClient, PushOptions, RequestOptions};
pub use config::RuntimeConfig;
pub use dispatch::{Handler, Middleware, Router};
pub use fallback::{FallbackController, FallbackStatus};
pub use pending::{execute_with_retry, RequestManager};
pub use server::{BroadcastOptions, DuplexServer};
pub use transport::{MemTransport, Transport};
