//! Dispatch module exports.
//!
//! Re-exports the router and the handler/middleware traits so downstream
//! consumers can depend on this module directly.

pub mod middleware;
pub mod router;

pub use middleware::{LoggingMiddleware, Middleware, ValidationMiddleware};
pub use router::{ErrorObserver, Handler, Router, RouterStatsSnapshot};
