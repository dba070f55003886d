//! Scheduler type definitions.
//!
//! This module contains error types, state enums, schedule descriptions and
//! command types for the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::schedule::{Schedule, ScheduleError};
use crate::core::types::{JobId, JobType, ScheduleId};

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Schedule not found.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(ScheduleId),

    /// The expression could not be parsed or has no future occurrence.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// Per-schedule submission settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    /// Max attempts for every job this schedule submits.
    pub max_attempts: Option<u32>,
    /// Correlation id attached to submitted jobs.
    pub correlation_id: Option<String>,
    /// Fire even while the previous job from this schedule is unfinished.
    pub allow_overlap: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            max_attempts: None,
            correlation_id: None,
            allow_overlap: true,
        }
    }
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set max attempts for submitted jobs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Builder: set the correlation id for submitted jobs.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Builder: allow or forbid overlapping firings.
    pub fn with_allow_overlap(mut self, allow: bool) -> Self {
        self.allow_overlap = allow;
        self
    }
}

/// A job the scheduler asks to be submitted.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub schedule_id: ScheduleId,
    pub job_type: JobType,
    pub payload: Value,
    pub max_attempts: Option<u32>,
    pub correlation_id: Option<String>,
}

/// Where fired schedules send their jobs.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    type Error: std::fmt::Display + Send;

    /// Submit a job on behalf of a schedule.
    async fn submit_scheduled(&self, job: ScheduledJob) -> Result<JobId, Self::Error>;

    /// Whether the job has not yet reached a terminal state.
    async fn is_active(&self, id: &JobId) -> bool;
}

/// Snapshot of a registered schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub id: ScheduleId,
    pub job_type: JobType,
    pub expression: String,
    pub timezone: String,
    pub next_fire: DateTime<Utc>,
    /// Number of jobs submitted so far.
    pub fired: u64,
    pub last_job: Option<JobId>,
    pub options: ScheduleOptions,
}

/// A registered schedule and its firing state.
#[derive(Debug, Clone)]
pub(crate) struct ScheduleEntry {
    pub(crate) id: ScheduleId,
    pub(crate) job_type: JobType,
    pub(crate) payload: Value,
    pub(crate) schedule: Schedule,
    pub(crate) options: ScheduleOptions,
    pub(crate) next_fire: DateTime<Utc>,
    pub(crate) fired: u64,
    pub(crate) last_job: Option<JobId>,
}

/// Upper bound on occurrences walked when catching up after a stall.
const MAX_COUNT_ITERATIONS: usize = 100;

impl ScheduleEntry {
    /// Create an entry whose first firing is the first occurrence after `now`.
    pub(crate) fn new(
        job_type: JobType,
        payload: Value,
        schedule: Schedule,
        options: ScheduleOptions,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let next_fire = schedule.next_after(now)?;
        Ok(Self {
            id: ScheduleId::new(),
            job_type,
            payload,
            schedule,
            options,
            next_fire,
            fired: 0,
            last_job: None,
        })
    }

    pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire <= now
    }

    /// Move `next_fire` past `now`.
    ///
    /// Returns how many occurrences were passed over (capped).
    pub(crate) fn advance(&mut self, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
        let mut passed = 0;
        let mut next = self.next_fire;
        while next <= now && passed < MAX_COUNT_ITERATIONS {
            passed += 1;
            next = self.schedule.next_after(next)?;
        }
        if next <= now {
            next = self.schedule.next_after(now)?;
        }
        self.next_fire = next;
        Ok(passed)
    }

    pub(crate) fn to_job(&self) -> ScheduledJob {
        ScheduledJob {
            schedule_id: self.id,
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            max_attempts: self.options.max_attempts,
            correlation_id: self.options.correlation_id.clone(),
        }
    }

    pub(crate) fn info(&self) -> ScheduleInfo {
        ScheduleInfo {
            id: self.id,
            job_type: self.job_type.clone(),
            expression: self.schedule.expression().to_string(),
            timezone: self.schedule.timezone().to_string(),
            next_fire: self.next_fire,
            fired: self.fired,
            last_job: self.last_job,
            options: self.options.clone(),
        }
    }
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Add a schedule.
    Register {
        entry: Box<ScheduleEntry>,
        response: oneshot::Sender<ScheduleId>,
    },
    /// Remove a schedule.
    Cancel {
        id: ScheduleId,
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// List registered schedules.
    List {
        response: oneshot::Sender<Vec<ScheduleInfo>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(interval: Duration, now: DateTime<Utc>) -> ScheduleEntry {
        ScheduleEntry::new(
            JobType::new("tick"),
            Value::Null,
            Schedule::every(interval).unwrap(),
            ScheduleOptions::default(),
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_first_fire_is_one_interval_out() {
        let now = Utc::now();
        let entry = entry(Duration::from_secs(10), now);

        assert_eq!(entry.next_fire, now + chrono::Duration::seconds(10));
        assert!(!entry.is_due(now));
    }

    #[test]
    fn test_advance_single_occurrence() {
        let now = Utc::now();
        let mut entry = entry(Duration::from_secs(10), now);
        let later = now + chrono::Duration::seconds(12);

        assert!(entry.is_due(later));
        assert_eq!(entry.advance(later).unwrap(), 1);
        assert_eq!(entry.next_fire, now + chrono::Duration::seconds(20));
    }

    #[test]
    fn test_advance_coalesces_missed_occurrences() {
        let now = Utc::now();
        let mut entry = entry(Duration::from_secs(1), now);
        let later = now + chrono::Duration::milliseconds(5500);

        assert_eq!(entry.advance(later).unwrap(), 5);
        assert!(entry.next_fire > later);
        assert!(entry.next_fire <= later + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_advance_after_long_stall_stays_bounded() {
        let now = Utc::now();
        let mut entry = entry(Duration::from_secs(1), now);
        let much_later = now + chrono::Duration::hours(5);

        assert_eq!(entry.advance(much_later).unwrap(), MAX_COUNT_ITERATIONS);
        assert!(entry.next_fire > much_later);
    }

    #[test]
    fn test_default_options_allow_overlap() {
        let options = ScheduleOptions::default();
        assert!(options.allow_overlap);
        assert!(!options.with_allow_overlap(false).allow_overlap);
    }
}
