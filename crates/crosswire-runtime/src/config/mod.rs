//! Runtime config loader (strict parsing).

pub mod schema;

use std::fs;

use crosswire_core::{CrosswireError, Result};

pub use schema::{ClientSection, FallbackSection, RuntimeConfig, ServerSection};

pub fn load_from_file(path: &str) -> Result<RuntimeConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| CrosswireError::Internal(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<RuntimeConfig> {
    let cfg: RuntimeConfig = serde_yaml::from_str(s)
        .map_err(|e| CrosswireError::Validation(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
