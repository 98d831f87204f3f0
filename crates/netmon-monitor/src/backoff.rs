//! Re-evaluation delay sequence and attempt-based gating.

use std::time::Duration;

/// Exponential backoff and attempt thresholds for one evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Forced re-evaluations are ignored until this many attempts were made.
    pub ignore_reevaluate_attempts: u32,
    /// Traffic attribution is dropped after this many attempts.
    pub blame_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10 * 60),
            ignore_reevaluate_attempts: 5,
            blame_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Returns the delay that follows `delay`: doubled, capped at `max_delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_delay)
    }

    /// Returns the first `count` delays of a fresh run.
    pub fn schedule(&self, count: usize) -> Vec<Duration> {
        let mut backoff = Backoff::new(*self);
        (0..count)
            .map(|_| {
                let delay = backoff.current();
                backoff.advance();
                delay
            })
            .collect()
    }
}

/// Mutable cursor over a [`BackoffPolicy`] delay sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    /// Starts a cursor at the initial delay.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial_delay.min(policy.max_delay),
            policy,
        }
    }

    /// Delay to use for the next scheduled attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the delay after a failed attempt.
    pub fn advance(&mut self) -> Duration {
        self.current = self.policy.next_delay(self.current);
        self.current
    }

    /// Returns to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay.min(self.policy.max_delay);
    }

    /// Returns the governing policy.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
