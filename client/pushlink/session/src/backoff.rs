//! Exponential backoff with a hard ceiling and bounded jitter.

use rand::Rng;
use std::time::Duration;

/// Policy controlling retry pacing for both session recovery and control
/// request retransmission.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for the jittered delay; doubling stops here.
    pub ceiling: Duration,
    /// Attempt budget, counting the first attempt.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Default pacing for session recovery.
    pub fn recovery() -> Self {
        Self {
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            max_attempts: 8,
        }
    }

    /// Default pacing for control request retransmission.
    pub fn requests() -> Self {
        Self {
            initial: Duration::from_millis(200),
            ceiling: Duration::from_secs(4),
            max_attempts: 4,
        }
    }

    /// Delay before the given 1-based attempt: exponential growth capped at
    /// the ceiling, plus uniform jitter that never pushes the total past
    /// the ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            delay = delay.saturating_mul(2).min(self.ceiling);
        }

        let headroom = self.ceiling.saturating_sub(delay);
        if headroom.is_zero() {
            return delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=headroom.as_millis() as u64);
        delay + Duration::from_millis(jitter_ms)
    }

    /// Whether the budget allows another attempt after `attempts` made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
