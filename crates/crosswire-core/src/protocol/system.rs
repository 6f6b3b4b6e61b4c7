//! System message vocabulary.
//!
//! Type strings are namespaced by a top-level category prefix; everything
//! the runtime itself speaks lives under `SYSTEM_`. Caller domains (task,
//! workflow, chat, ...) define their own prefixes.

pub const CONNECT: &str = "SYSTEM_CONNECT";
pub const DISCONNECT: &str = "SYSTEM_DISCONNECT";
pub const PING: &str = "SYSTEM_PING";
pub const STATUS: &str = "SYSTEM_STATUS";
pub const DEBUG_ENABLE: &str = "SYSTEM_DEBUG_ENABLE";
pub const DEBUG_DISABLE: &str = "SYSTEM_DEBUG_DISABLE";

/// Every built-in system type, in registration order.
pub const ALL: &[&str] = &[
    CONNECT,
    DISCONNECT,
    PING,
    STATUS,
    DEBUG_ENABLE,
    DEBUG_DISABLE,
];
