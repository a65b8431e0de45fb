//! Exponential backoff shared by watch reconnects and annotation retries

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry policy with exponential growth and jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (only enforced by bounded callers)
    pub steps: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Growth factor applied after every delay
    pub factor: f64,
    /// Random extra delay, as a fraction of the current delay
    pub jitter: f64,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_delay_ms: 10,
            factor: 2.0,
            jitter: 0.1,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Policy used between watch reconnect attempts
    pub fn reconnect() -> Self {
        Self {
            steps: u32::MAX,
            initial_delay_ms: 200,
            factor: 2.0,
            jitter: 0.2,
            max_delay_ms: 30_000,
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Stateful delay generator for a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let current = Duration::from_millis(policy.initial_delay_ms);
        Self { policy, current }
    }

    /// Return the next delay and grow the internal one
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.min(self.policy.max_delay());
        let grown = base.as_millis() as f64 * self.policy.factor.max(1.0);
        self.current = Duration::from_millis(grown.round() as u64).min(self.policy.max_delay());

        if self.policy.jitter > 0.0 {
            let extra = base.as_millis() as f64 * self.policy.jitter * rand::random::<f64>();
            base + Duration::from_millis(extra as u64)
        } else {
            base
        }
    }

    pub fn reset(&mut self) {
        self.current = Duration::from_millis(self.policy.initial_delay_ms);
    }
}

/// Sleep for `delay` unless `token` fires first. Returns true when cancelled.
pub async fn sleep_or_cancelled(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
