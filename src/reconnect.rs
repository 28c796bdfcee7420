//! Reconnect policy for generation streams.
//!
//! Exponential backoff capped at a maximum delay, with proportional jitter so
//! clients that lost the same backend do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::StreamConfig;
use crate::events::ServerErrorEvent;

/// Backoff and attempt bookkeeping for one stream session.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
            max_attempts: config.max_reconnect_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn reset(&mut self) {
        if self.attempts > 0 {
            log::debug!("reconnect attempts reset after {} attempt(s)", self.attempts);
        }
        self.attempts = 0;
    }

    /// Delay before reconnect `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before reconnect `attempt` with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
        delay + delay.mul_f64(self.jitter_factor * roll)
    }

    /// Records a failure. Returns the delay for the next attempt, or `None`
    /// when the attempt budget is spent.
    pub fn register_failure(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }
}

/// Server-declared errors are resumable only when the server says so.
pub fn is_server_error_recoverable(event: &ServerErrorEvent) -> bool {
    event.can_resume
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, jitter: f64) -> ReconnectPolicy {
        ReconnectPolicy::new(&StreamConfig {
            max_reconnect_attempts: max_attempts,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            jitter_factor: jitter,
            ..Default::default()
        })
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let p = policy(10, 0.0);
        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = p.base_delay_for(attempt);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            assert!(delay <= Duration::from_millis(30_000));
            previous = delay;
        }
        assert_eq!(p.base_delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(4000));
        assert_eq!(p.base_delay_for(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = policy(5, 0.5);
        for _ in 0..100 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(2000));
            assert!(d <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let mut p = policy(3, 0.0);
        assert!(p.register_failure().is_some());
        assert!(p.register_failure().is_some());
        assert!(p.can_retry());
        assert_eq!(p.remaining(), 1);
        assert!(p.register_failure().is_some());
        assert!(!p.can_retry());
        assert!(p.register_failure().is_none());
        assert_eq!(p.attempts(), 3);

        p.reset();
        assert_eq!(p.attempts(), 0);
        assert!(p.can_retry());
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = policy(100, 0.0);
        assert_eq!(p.base_delay_for(64), Duration::from_millis(30_000));
    }
}
