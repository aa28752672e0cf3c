//! Exponential backoff with symmetric jitter

use std::time::Duration;

/// Backoff state for one polling loop.
///
/// Delay for attempt `n` is `base * 2^n`, capped at `ceiling`, then scaled by
/// a random factor in `[1 - jitter, 1 + jitter]`. A server `Retry-After`
/// longer than that wins, but never past `ceiling`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration, jitter: f64) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the current attempt.
    pub fn raw_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    /// Delay to sleep before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        let delay = apply_jitter(self.raw_delay(), self.jitter, rand::random::<f64>());
        self.attempt = self.attempt.saturating_add(1);
        match retry_after {
            Some(server) if server > delay => server.min(self.ceiling),
            _ => delay,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Scale `delay` by `1 + jitter * (2r - 1)` for `r` in `[0, 1)`.
fn apply_jitter(delay: Duration, jitter: f64, r: f64) -> Duration {
    let factor = 1.0 + jitter * (2.0 * r - 1.0);
    delay.mul_f64(factor.max(0.0))
}
