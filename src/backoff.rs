//! Reconnect delay policy.
//!
//! Used by the connection manager's disconnect-driven reconnect loop. Initial
//! connect attempts are never retried here; a lookup or connect failure is
//! reported to the caller exactly once.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling exponential reconnect backoff with lightweight jitter.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(50),
        }
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReconnectPolicy;

    fn no_jitter_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = no_jitter_policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped_at_max_backoff() {
        let policy = no_jitter_policy();
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
            jitter: Duration::from_millis(25),
        };
        for attempt in 1..=20 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }
}
