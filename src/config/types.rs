//! Configuration type definitions.
//!
//! This module contains the type definitions for the YAML engine
//! configuration: worker count, retry defaults, timing and schedules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::core::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, RetryPolicy};
use crate::core::schedule::{Schedule, ScheduleError};
use crate::scheduler::ScheduleOptions;

/// Engine configuration (hopper.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Max attempts for jobs that do not set their own.
    pub default_max_attempts: u32,
    /// Engine-wide retry policy.
    pub retry: RetryConfig,
    /// How often the scheduler checks for due schedules.
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,
    /// How long shutdown waits for running jobs.
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
    /// Recurring jobs started with the engine.
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_max_attempts: 3,
            retry: RetryConfig::default(),
            tick_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            schedules: Vec::new(),
        }
    }
}

/// Backoff strategy name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyConfig {
    /// Doubling delay capped at `max_delay`.
    #[default]
    Exponential,
    /// `base_delay` before every retry.
    Fixed,
    /// Never retry.
    None,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: RetryStrategyConfig,
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyConfig::Exponential,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryConfig {
    /// Build the retry policy this configuration describes.
    pub fn to_policy(&self) -> RetryPolicy {
        match self.strategy {
            RetryStrategyConfig::Exponential => {
                RetryPolicy::exponential(self.base_delay, self.max_delay)
            }
            RetryStrategyConfig::Fixed => RetryPolicy::fixed(self.base_delay),
            RetryStrategyConfig::None => RetryPolicy::none(),
        }
    }
}

/// A recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Job type submitted at every firing.
    pub job_type: String,
    /// Cron expression, shortcut (`@daily`) or interval (`@every 10s`).
    pub schedule: String,
    /// IANA timezone for cron expressions.
    pub timezone: Option<String>,
    /// Payload passed to every submitted job.
    #[serde(default)]
    pub payload: Value,
    pub max_attempts: Option<u32>,
    pub correlation_id: Option<String>,
    /// Fire while the previous job from this schedule is still unfinished.
    #[serde(default = "default_true")]
    pub allow_overlap: bool,
}

fn default_true() -> bool {
    true
}

impl ScheduleConfig {
    /// Parse the schedule expression.
    pub fn to_schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::with_timezone(
            self.schedule.as_str(),
            self.timezone.as_deref().unwrap_or("UTC"),
        )
    }

    /// Submission options for jobs fired by this schedule.
    pub fn options(&self) -> ScheduleOptions {
        ScheduleOptions {
            max_attempts: self.max_attempts,
            correlation_id: self.correlation_id.clone(),
            allow_overlap: self.allow_overlap,
        }
    }
}

/// Serde helper for durations written as `"500ms"`, `"30s"`, `"1h30m"`.
mod duration_str {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    use crate::core::schedule::{format_duration, parse_duration};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text).map_err(D::Error::custom)
    }
}
