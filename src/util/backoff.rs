use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MILLIS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MILLIS),
        }
    }
}

/// Jittered exponential backoff used by the persistent streams.
///
/// The first call to [`ExponentialBackoff::next_delay`] after a reset returns
/// zero; each later call applies `±RANDOM_FACTOR` jitter to the current base
/// delay, then grows the base by the configured factor up to `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Clears accumulated delay so the next attempt runs immediately.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Forces the next attempt to wait for the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = jittered(self.current_base, rng);
        let grown = self.current_base.mul_f64(self.config.backoff_factor);
        self.current_base = grown
            .max(self.config.initial_delay)
            .min(self.config.max_delay);
        delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

fn jittered<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let base_millis = base.as_millis() as f64;
    let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    Duration::from_millis((base_millis + jitter).round().max(0.0) as u64)
}
