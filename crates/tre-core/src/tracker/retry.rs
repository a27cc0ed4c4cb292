//! Request pacing and retry backoff for the tracker client.

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::trace;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff: `base * factor^(n-1)`, capped at `max_delay`, with
/// up to half of each delay shaved off at random when `jitter` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before retry number `retry` (1-based). A server-provided
    /// `Retry-After` raises the delay but never past `max_delay`.
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.factor.powi(retry.saturating_sub(1) as i32);
        let raw = self.base.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped);
        if self.jitter && !delay.is_zero() {
            let scale: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            delay = delay.mul_f64(scale);
        }
        match retry_after {
            Some(ra) if ra > delay => ra.min(self.max_delay),
            _ => delay,
        }
    }
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Keeps consecutive calls at least `1 / rps` apart by sleeping the caller.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(rps: f64) -> Self {
        let interval = if rps.is_finite() && rps > 0.0 {
            Duration::from_secs_f64(1.0 / rps)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                let pause = self.interval - elapsed;
                trace!(?pause, "throttling");
                std::thread::sleep(pause);
            }
        }
        self.last = Some(Instant::now());
    }
}
