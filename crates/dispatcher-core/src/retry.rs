//! Retry policy: pure decision function for failed deliveries.

use crate::FailureKind;
use rand::Rng;
use std::time::Duration;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Cap on the exponential backoff.
    pub max_delay: Duration,
    /// Total delivery attempts before giving up. With `max_attempts = 3` an
    /// event is attempted exactly three times.
    pub max_attempts: u32,
    /// Spread delays by a uniform 0.8–1.2 factor so concurrent instances do
    /// not reclaim retries in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(900),
            max_attempts: 20,
            jitter: true,
        }
    }
}

/// Decision for a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Release the claim; the event becomes claimable after the delay.
    RetryAfter(Duration),
    /// Mark the event failed-terminal.
    GiveUp,
}

impl RetryPolicy {
    /// Decide what to do after `attempt_count` total attempts have failed
    /// with `cause`.
    pub fn decide(&self, attempt_count: u32, cause: FailureKind) -> RetryDecision {
        match cause {
            FailureKind::Permanent => RetryDecision::GiveUp,
            // The loop releases and stops before consulting the policy; a
            // zero delay keeps the event immediately eligible elsewhere.
            FailureKind::Unauthorized => RetryDecision::RetryAfter(Duration::ZERO),
            // The loop settles unroutable events as skipped before the
            // policy is consulted; retrying cannot conjure a destination.
            FailureKind::Unroutable => RetryDecision::GiveUp,
            FailureKind::Transient => {
                if attempt_count >= self.max_attempts {
                    return RetryDecision::GiveUp;
                }
                RetryDecision::RetryAfter(self.backoff(attempt_count))
            }
        }
    }

    /// `base * 2^(attempt_count - 1)`, capped at `max_delay`.
    fn backoff(&self, attempt_count: u32) -> Duration {
        let exp = attempt_count.saturating_sub(1).min(30);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(900),
            max_attempts,
            jitter: false,
        }
    }

    #[test]
    fn test_first_transient_failure_retries_after_base() {
        let p = policy(100, 3);
        assert_eq!(
            p.decide(1, FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let p = policy(100, 10);
        assert_eq!(
            p.decide(2, FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            p.decide(3, FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_millis(400))
        );
        assert_eq!(
            p.decide(5, FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_millis(1600))
        );
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let p = RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(900),
            max_attempts: 50,
            jitter: false,
        };
        assert_eq!(
            p.decide(30, FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_transient_gives_up_at_max_attempts() {
        let p = policy(100, 3);
        assert_eq!(p.decide(3, FailureKind::Transient), RetryDecision::GiveUp);
        assert_eq!(p.decide(4, FailureKind::Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn test_permanent_always_gives_up() {
        let p = policy(100, 20);
        assert_eq!(p.decide(1, FailureKind::Permanent), RetryDecision::GiveUp);
        assert_eq!(p.decide(19, FailureKind::Permanent), RetryDecision::GiveUp);
    }

    #[test]
    fn test_unauthorized_does_not_give_up() {
        let p = policy(100, 3);
        assert_eq!(
            p.decide(1, FailureKind::Unauthorized),
            RetryDecision::RetryAfter(Duration::ZERO)
        );
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(900),
            max_attempts: 10,
            jitter: true,
        };
        for _ in 0..100 {
            match p.decide(1, FailureKind::Transient) {
                RetryDecision::RetryAfter(d) => {
                    assert!(d >= Duration::from_millis(800), "jitter too low: {:?}", d);
                    assert!(d <= Duration::from_millis(1200), "jitter too high: {:?}", d);
                }
                RetryDecision::GiveUp => panic!("unexpected give-up"),
            }
        }
    }
}
