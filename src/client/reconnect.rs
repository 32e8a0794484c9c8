//! Exponential-backoff reconnection policy (§9: "a standalone policy
//! object reused by stream and datagram handlers").

use rand::Rng;
use std::time::Duration;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(12);
const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `None` disables the retry cap.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Whether `attempt` (1-indexed, the attempt that just failed) has
    /// exhausted the retry budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_retries, Some(max) if attempt >= max)
    }

    /// Delay before attempt `attempt + 1`, doubling from `base_delay`,
    /// capped at `max_delay`, with up to 20% jitter so a fleet of clients
    /// reconnecting at once doesn't retry in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let doubled = self.base_delay.saturating_mul(1u32.wrapping_shl(exponent).max(1));
        let capped = doubled.min(self.max_delay);

        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.2);
        let jitter = capped.mul_f64(jitter_fraction);
        capped.saturating_sub(jitter)
    }
}
