use crate::types::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and optional additive jitter.
///
/// Successive delays never decrease, even with jitter applied.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
    retries: u32,
    previous: Duration,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy, cap: Duration, jitter: bool) -> Self {
        Self {
            base: policy.backoff_base(),
            cap,
            jitter,
            retries: 0,
            previous: Duration::ZERO,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let exponential = self
            .base
            .saturating_mul(1u32 << self.retries.min(20))
            .min(self.cap);
        self.retries += 1;

        let mut delay = exponential;
        if self.jitter && !exponential.is_zero() {
            let spread = (exponential.as_millis() as u64 / 2).max(1);
            let extra = rand::thread_rng().gen_range(0..=spread);
            delay = (exponential + Duration::from_millis(extra)).min(self.cap);
        }

        delay = delay.max(self.previous);
        self.previous = delay;
        delay
    }
}
