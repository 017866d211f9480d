//! Reconnect backoff with jitter.

use std::time::Duration;

use rand::RngExt;

use crate::config::ReconnectPolicy;

/// Current reconnect delay, advanced geometrically after each failure.
#[derive(Debug, Clone)]
pub struct BackoffState {
    initial: Duration,
    current: Duration,
    multiplier: f64,
    cap: Duration,
    jitter: Duration,
}

impl BackoffState {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        let policy = policy.clone().normalized();
        Self {
            initial: policy.initial_delay,
            current: policy.initial_delay,
            multiplier: policy.multiplier,
            cap: policy.max_delay,
            jitter: policy.jitter,
        }
    }

    /// Delay before the next attempt, without jitter.
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Delay before the next attempt plus a uniform random `[0, jitter)`.
    pub fn delay_with_jitter(&self) -> Duration {
        self.current + random_jitter(self.jitter)
    }

    /// Multiply the delay, capped at the maximum. A product too large for a
    /// `Duration` lands on the cap.
    pub fn advance(&mut self) {
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .map_or(self.cap, |next| next.min(self.cap));
        if next > self.current {
            self.current = next;
        }
    }

    pub const fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn random_jitter(ceiling: Duration) -> Duration {
    let Ok(ceiling_ms) = u64::try_from(ceiling.as_millis()) else {
        return Duration::ZERO;
    };
    if ceiling_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..ceiling_ms))
}
