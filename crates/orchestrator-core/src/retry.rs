//! Retry/backoff policy for pipeline attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with multiplicative jitter, per SPEC_FULL.md §7:
/// `min(base * 2^(attempt-1), cap) * jitter` where `jitter ~ U(0.5, 1.5)`.
///
/// This differs from a plain additive-jitter scheme (offsetting the
/// capped delay by ± a percentage): here the jitter is a multiplier
/// applied directly to the capped exponential value, so the delay can
/// range from half to one-and-a-half times the nominal backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base: Duration,
    #[serde(with = "duration_millis")]
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential_jitter(5)
    }
}

impl RetryPolicy {
    /// `max_attempts` includes the initial attempt, per SPEC_FULL.md §7
    /// ("attempts are bounded by `task.max_retries` plus one").
    pub fn exponential_jitter(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }

    pub fn from_max_retries(max_retries: u32) -> Self {
        Self::exponential_jitter(max_retries + 1)
    }

    /// Delay before the retry following a failed `attempt` (1-based).
    /// `attempt` is the attempt that just failed; this is the delay
    /// before attempt `attempt + 1` begins.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.base.as_secs_f64() * 2f64.powi(exponent as i32);
        let capped = base.min(self.cap.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(capped * jitter)
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_bounds_of_nominal_backoff() {
        let policy = RetryPolicy::exponential_jitter(5);
        for attempt in 1..=4 {
            let nominal = (policy.base.as_secs_f64() * 2f64.powi((attempt - 1) as i32))
                .min(policy.cap.as_secs_f64());
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt).as_secs_f64();
                assert!(delay >= nominal * 0.5 - 1e-6);
                assert!(delay <= nominal * 1.5 + 1e-6);
            }
        }
    }

    #[test]
    fn delay_is_capped_for_large_attempts() {
        let policy = RetryPolicy::exponential_jitter(20);
        let delay = policy.delay_for_attempt(20).as_secs_f64();
        assert!(delay <= policy.cap.as_secs_f64() * 1.5 + 1e-6);
    }

    #[test]
    fn from_max_retries_adds_the_initial_attempt() {
        let policy = RetryPolicy::from_max_retries(2);
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }
}
