//! Per-action retry policy: exponential backoff capped at a maximum
//! delay, with an escape hatch for errors that should never be retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration attached to an [`super::step::ActionStep`].
///
/// Delay doubles per attempt (`multiplier`), capped by `max_delay`. An
/// error whose `code` appears in `non_retryable_codes`, or whose
/// `retryable` flag is `false`, short-circuits retrying regardless of
/// attempts remaining (spec §4.8's `shouldRetry(err)` predicate,
/// expressed as data since closures don't survive a workflow state
/// round-trip — see the workspace's re-architecture notes on
/// callback-centric builders).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    #[serde(default)]
    pub non_retryable_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// No retries: the first failure is terminal.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            non_retryable_codes: vec![],
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            multiplier: 2.0,
            non_retryable_codes: vec![],
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_non_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.non_retryable_codes.push(code.into());
        self
    }

    /// Delay before the given attempt (1-based; attempt 1 never delays).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = (attempt - 1) as i32 - 1;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry_num.max(0));
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether a failed attempt with the given error code/retryable flag
    /// should be retried at all, independent of attempts remaining.
    pub fn should_retry(&self, retryable: bool, code: Option<&str>) -> bool {
        if !retryable {
            return false;
        }
        match code {
            Some(code) => !self.non_retryable_codes.iter().any(|c| c == code),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_non_retryable_code_short_circuits() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1), Duration::from_secs(1))
            .with_non_retryable_code("VALIDATION");
        assert!(!policy.should_retry(true, Some("VALIDATION")));
        assert!(policy.should_retry(true, Some("TRANSIENT")));
        assert!(!policy.should_retry(false, None));
    }

    #[test]
    fn test_serialization_round_trip() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(50), Duration::from_secs(2));
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
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
