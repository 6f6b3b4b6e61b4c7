use serde::Deserialize;

use crosswire_core::{CrosswireError, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub version: u32,

    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub fallback: FallbackSection,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: 1,
            client: ClientSection::default(),
            server: ServerSection::default(),
            fallback: FallbackSection::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(CrosswireError::Validation(format!(
                "unsupported config version: {}",
                self.version
            )));
        }
        self.client.validate()?;
        self.server.validate()?;
        self.fallback.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    /// Stable sender identity; generated when absent.
    #[serde(default)]
    pub sender_id: Option<String>,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Hard ceiling for the cleanup sweep backstop.
    #[serde(default = "default_request_ceiling_ms")]
    pub request_ceiling_ms: u64,

    #[serde(default = "default_epoch_check_interval_ms")]
    pub epoch_check_interval_ms: u64,

    /// Per-subscriber queue depth for push/message streams.
    #[serde(default = "default_subscriber_depth")]
    pub subscriber_depth: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            sender_id: None,
            max_in_flight: default_max_in_flight(),
            default_timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            request_ceiling_ms: default_request_ceiling_ms(),
            epoch_check_interval_ms: default_epoch_check_interval_ms(),
            subscriber_depth: default_subscriber_depth(),
        }
    }
}

impl ClientSection {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10_000).contains(&self.max_in_flight) {
            return Err(CrosswireError::Validation(
                "client.max_in_flight must be between 1 and 10000".into(),
            ));
        }
        if !(1_000..=300_000).contains(&self.default_timeout_ms) {
            return Err(CrosswireError::Validation(
                "client.default_timeout_ms must be between 1000 and 300000".into(),
            ));
        }
        if !(100..=60_000).contains(&self.connect_timeout_ms) {
            return Err(CrosswireError::Validation(
                "client.connect_timeout_ms must be between 100 and 60000".into(),
            ));
        }
        if self.cleanup_interval_ms < 10 {
            return Err(CrosswireError::Validation(
                "client.cleanup_interval_ms must be at least 10".into(),
            ));
        }
        if self.request_ceiling_ms <= self.default_timeout_ms {
            return Err(CrosswireError::Validation(
                "client.request_ceiling_ms must be greater than default_timeout_ms".into(),
            ));
        }
        if self.epoch_check_interval_ms < 10 {
            return Err(CrosswireError::Validation(
                "client.epoch_check_interval_ms must be at least 10".into(),
            ));
        }
        if self.subscriber_depth == 0 {
            return Err(CrosswireError::Validation(
                "client.subscriber_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_server_id")]
    pub server_id: String,

    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Cap per cached push queue; oldest entries evicted first.
    #[serde(default = "default_push_cache_capacity")]
    pub push_cache_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            push_cache_capacity: default_push_cache_capacity(),
        }
    }
}

impl ServerSection {
    pub fn validate(&self) -> Result<()> {
        if self.server_id.is_empty() {
            return Err(CrosswireError::Validation(
                "server.server_id must not be empty".into(),
            ));
        }
        if self.sweep_interval_ms < 10 {
            return Err(CrosswireError::Validation(
                "server.sweep_interval_ms must be at least 10".into(),
            ));
        }
        if self.inactivity_timeout_ms <= self.sweep_interval_ms {
            return Err(CrosswireError::Validation(
                "server.inactivity_timeout_ms must be greater than sweep_interval_ms".into(),
            ));
        }
        if !(1..=10_000).contains(&self.push_cache_capacity) {
            return Err(CrosswireError::Validation(
                "server.push_cache_capacity must be between 1 and 10000".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackSection {
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,

    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Error rate (0,1] above which traffic is demoted to the legacy path.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Minimum settled calls in the window before the rate is trusted.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            enabled: default_fallback_enabled(),
            sample_interval_ms: default_sample_interval_ms(),
            window_ms: default_window_ms(),
            error_rate_threshold: default_error_rate_threshold(),
            min_samples: default_min_samples(),
        }
    }
}

impl FallbackSection {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms < 10 {
            return Err(CrosswireError::Validation(
                "fallback.sample_interval_ms must be at least 10".into(),
            ));
        }
        if self.window_ms < self.sample_interval_ms {
            return Err(CrosswireError::Validation(
                "fallback.window_ms must be at least sample_interval_ms".into(),
            ));
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(CrosswireError::Validation(
                "fallback.error_rate_threshold must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_in_flight() -> usize {
    100
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_cleanup_interval_ms() -> u64 {
    60_000
}
fn default_request_ceiling_ms() -> u64 {
    300_000
}
fn default_epoch_check_interval_ms() -> u64 {
    1_000
}
fn default_subscriber_depth() -> usize {
    64
}
fn default_server_id() -> String {
    "worker".into()
}
fn default_inactivity_timeout_ms() -> u64 {
    300_000
}
fn default_sweep_interval_ms() -> u64 {
    60_000
}
fn default_push_cache_capacity() -> usize {
    100
}
fn default_fallback_enabled() -> bool {
    true
}
fn default_sample_interval_ms() -> u64 {
    10_000
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_error_rate_threshold() -> f64 {
    0.5
}
fn default_min_samples() -> u64 {
    10
}
