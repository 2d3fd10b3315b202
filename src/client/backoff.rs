//! Linear reconnect backoff
//!
//! The first retry happens immediately. After `k` consecutive failures the
//! next delay is `min(k * step, ceiling)`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    ceiling: Duration,
    retries: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(step: Duration, ceiling: Duration) -> Self {
        Self {
            step,
            ceiling,
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    /// Delay to wait before the next retry
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Consecutive failures since the last reset
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Record a failure; returns the delay to wait before retrying it
    pub fn next(&mut self) -> Duration {
        let wait = self.delay;
        self.retries = self.retries.saturating_add(1);
        self.delay = self.step.saturating_mul(self.retries).min(self.ceiling);
        wait
    }

    pub fn reset(&mut self) {
        self.retries = 0;
        self.delay = Duration::ZERO;
    }
}
