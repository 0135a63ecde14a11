//! Retry policies: bounded linear backoff for connect attempts and for
//! queued transmissions while offline, plus the fixed reconnect delay.

use std::time::Duration;

/// Bounded linear backoff: attempt `n` (1-indexed) waits `n × step`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff unit; attempt `n` waits `n` times this.
    pub step: Duration,
    /// Maximum number of attempts before giving up.  `0` means unlimited.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Policy for establishing the transport: 5 attempts, 300 ms unit.
    /// A misconfigured client must not retry forever.
    pub fn connect() -> Self {
        Self {
            step: Duration::from_millis(300),
            max_attempts: 5,
        }
    }

    /// Policy for requests issued while disconnected: 20 attempts, 300 ms
    /// unit.  Exhaustion logs a give-up event; the request itself stays
    /// queued for replay on the next reconnect.
    pub fn offline_send() -> Self {
        Self {
            step: Duration::from_millis(300),
            max_attempts: 20,
        }
    }

    /// Delay before the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.step * attempt
    }

    /// Whether the given attempt number exceeds the cap.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

/// Delay between losing an established session and the next connect cycle.
/// Deliberately fixed rather than exponential: once a session existed,
/// transient blips should retry promptly.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default keep-alive ping interval.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_policy_values() {
        let p = RetryPolicy::connect();
        assert_eq!(p.step, Duration::from_millis(300));
        assert_eq!(p.max_attempts, 5);
    }

    #[test]
    fn delay_grows_linearly() {
        let p = RetryPolicy::offline_send();
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(300));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(600));
        assert_eq!(p.delay_for_attempt(20), Duration::from_millis(6000));
    }

    #[test]
    fn gives_up_past_the_cap() {
        let p = RetryPolicy::connect();
        assert!(!p.should_give_up(5));
        assert!(p.should_give_up(6));
    }

    #[test]
    fn unlimited_never_gives_up() {
        let p = RetryPolicy {
            step: Duration::from_millis(1),
            max_attempts: 0,
        };
        assert!(!p.should_give_up(1_000_000));
    }
}
