//! Top-level facade crate for crosswire.
//!
//! Re-exports core types and the runtime library so users can depend on a single crate.

pub mod core {
    pub use crosswire_core::*;
}

pub mod runtime {
    pub use crosswire_runtime::*;
}
