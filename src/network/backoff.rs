use rand::Rng;
use std::time::Duration;

// Doubling past this exponent would overflow any realistic base anyway.
const MAX_EXPONENT: u32 = 20;

/// Fraction of the deterministic delay that jitter may add on top.
const JITTER_FRACTION: f64 = 0.25;

/// Exponential reconnect backoff: `min(base * 2^(attempt - 1), cap)` plus
/// bounded jitter. `attempt` counts consecutive failures within one
/// disconnection episode and resets only on a successful connect.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Deterministic delay for the given consecutive-failure count.
    /// Non-decreasing in `attempt` and never above `cap`; zero failures
    /// means no wait.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    /// `delay_for` with up to 25% random jitter added, still clamped to
    /// `cap` so the configured maximum holds.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if delay.is_zero() {
            return delay;
        }
        let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..JITTER_FRACTION));
        (delay + jitter).min(self.cap)
    }
}
