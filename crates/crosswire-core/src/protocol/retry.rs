//! Retry policy and backoff arithmetic.
//!
//! The policy is wire-serializable so a request envelope can carry it; the
//! retryability predicate is process-local only and travels in the send
//! options, never on the wire.

use serde::{Deserialize, Serialize};

use crate::error::CrosswireError;

/// Delay growth strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Caller-supplied predicate deciding retryability from a failure.
pub type RetryPredicate = dyn Fn(&CrosswireError) -> bool + Send + Sync;

/// Retry policy for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first try. Always >= 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts, milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Hard cap on any single computed delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_interval_ms() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
            backoff: Backoff::default(),
            multiplier: default_multiplier(),
            max_interval_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after failed attempt `attempt` (0-based), milliseconds.
    ///
    /// fixed: `interval`; linear: `interval * (attempt + 1)`;
    /// exponential: `interval * multiplier^attempt`. Clamped to
    /// `max_interval_ms` when set.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let raw = match self.backoff {
            Backoff::Fixed => self.interval_ms,
            Backoff::Linear => self.interval_ms.saturating_mul(attempt as u64 + 1),
            Backoff::Exponential => {
                let factor = self.multiplier.max(1.0).powi(attempt as i32);
                (self.interval_ms as f64 * factor).min(u64::MAX as f64) as u64
            }
        };
        match self.max_interval_ms {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }

    /// Whether `error` should be retried after `attempts_so_far` tries.
    ///
    /// The predicate, when present, fully owns the decision; otherwise the
    /// error's own retryability applies. The attempt budget always binds.
    pub fn should_retry(
        &self,
        error: &CrosswireError,
        attempts_so_far: u32,
        predicate: Option<&RetryPredicate>,
    ) -> bool {
        if attempts_so_far >= self.max_attempts {
            return false;
        }
        match predicate {
            Some(p) => p(error),
            None => error.retryable(),
        }
    }
}
