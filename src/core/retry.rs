//! Retry policy configuration for jobs.
//!
//! Supports exponential backoff (the default) and fixed delays. A policy is
//! a pure function of the attempt count and the error; it never sleeps.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::handler::HandlerError;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(#[serde(with = "serde_duration")] Duration),

    /// `min(base * 2^(attempt-1), max)`.
    Exponential {
        #[serde(with = "serde_duration")]
        base: Duration,
        #[serde(with = "serde_duration")]
        max: Duration,
    },
}

impl Backoff {
    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1);
                2u32.checked_pow(exponent)
                    .and_then(|factor| base.checked_mul(factor))
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

/// Conditions under which a job should be retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryCondition {
    /// Retry any error not marked permanent.
    #[default]
    Always,

    /// Never retry, regardless of max_attempts.
    Never,
}

/// Outcome of evaluating a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `delay`.
    Retry { delay: Duration },
    /// Stop and mark the job failed.
    GiveUp,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Retry policy for a job type.
///
/// `max_attempts` belongs to the job; the policy decides how long to wait
/// and whether a given error is worth another attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay strategy.
    pub backoff: Backoff,

    /// Condition for when to retry.
    pub retry_on: RetryCondition,
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn none() -> Self {
        Self {
            backoff: Backoff::Fixed(Duration::ZERO),
            retry_on: RetryCondition::Never,
        }
    }

    /// Create a policy with fixed delay retries.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed(delay),
            retry_on: RetryCondition::Always,
        }
    }

    /// Create a policy with capped exponential backoff.
    ///
    /// # Arguments
    /// * `base` - Delay after the first failed attempt
    /// * `max` - Upper bound for any single delay
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential { base, max },
            retry_on: RetryCondition::Always,
        }
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.retry_on != RetryCondition::Never
    }

    /// Check if we should retry given the attempts made so far.
    ///
    /// # Arguments
    /// * `attempt` - Number of attempts already made (including the failed one)
    /// * `max_attempts` - Total attempts allowed for the job
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        self.is_enabled() && attempt < max_attempts
    }

    /// Decide what happens after attempt `attempt` failed with `error`.
    pub fn evaluate(&self, attempt: u32, max_attempts: u32, error: &HandlerError) -> RetryDecision {
        if error.is_permanent() || !self.should_retry(attempt, max_attempts) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff.delay_for_attempt(attempt),
        }
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as milliseconds.
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
