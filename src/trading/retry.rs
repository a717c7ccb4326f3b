//! Exponential backoff with full jitter.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rand::Rng;
use std::time::Duration;

/// Delays grow as `base * 2^n` up to `cap`; each actual wait is drawn
/// uniformly from `[0, delay]`. Never gives up on its own.
pub struct FullJitter {
    inner: ExponentialBackoff,
    cap: Duration,
}

impl FullJitter {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(base)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(cap)
            .with_max_elapsed_time(None)
            .build();

        Self { inner, cap }
    }

    /// Next wait.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.inner.next_backoff().unwrap_or(self.cap).min(self.cap);
        let millis = ceiling.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Sleep for the next wait.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}
