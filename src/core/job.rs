//! The job record and its lifecycle state machine.
//!
//! A [`Job`] is the unit of work: identity, handler type, payload and
//! lifecycle metadata. Jobs are never mutated in place by the engine;
//! every change is expressed as a [`JobUpdate`] and applied through
//! [`Job::apply`], which validates the requested transition before
//! writing any field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use super::types::{JobId, JobType, ScheduleId};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Created, not yet placed in any queue.
    Pending,
    /// Waiting in the ready queue for a worker.
    Ready,
    /// A worker is executing the handler.
    Running,
    /// Waiting in the delay queue for a retry or a deferred start.
    RetryWait,
    /// The handler succeeded.
    Completed,
    /// The job will never run again.
    Failed,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Ready,
        JobState::Running,
        JobState::RetryWait,
        JobState::Completed,
        JobState::Failed,
    ];

    /// Whether no further transition is permitted out of this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Pending -> Failed` and `Ready -> Failed` exist only for jobs whose
    /// type has no registered handler.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, RetryWait)
                | (Pending, Failed)
                | (Ready, Running)
                | (Ready, Failed)
                | (Running, Completed)
                | (Running, RetryWait)
                | (Running, Failed)
                | (RetryWait, Ready)
        )
    }

    /// Get the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::RetryWait => "retry_wait",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised when an update violates the job state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The state machine has no edge between the two states.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// The job already reached a terminal state.
    #[error("job is {0} and can no longer change")]
    Terminal(JobState),

    /// The attempt counter may only advance together with `Running`.
    #[error("attempt counter can only advance when entering running")]
    AttemptWithoutRun,

    /// Starting another attempt would exceed `max_attempts`.
    #[error("attempt {attempt} would exceed max_attempts {max_attempts}")]
    AttemptsExhausted { attempt: u32, max_attempts: u32 },
}

/// A unit of submitted work and its lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    job_type: JobType,
    payload: Value,
    state: JobState,
    attempt: u32,
    max_attempts: u32,
    next_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    schedule_id: Option<ScheduleId>,
    correlation_id: Option<String>,
}

impl Job {
    /// Create a new pending job with a fresh id.
    ///
    /// `max_attempts` is clamped to at least 1.
    pub fn new(job_type: impl Into<JobType>, payload: Value, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            state: JobState::Pending,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            next_run_at: None,
            last_error: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            schedule_id: None,
            correlation_id: None,
        }
    }

    /// Builder: tag the job with the schedule that fired it.
    pub fn with_schedule_id(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    /// Builder: tag the job with a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Number of execution attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Earliest time a delayed job may become ready.
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.next_run_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn schedule_id(&self) -> Option<ScheduleId> {
        self.schedule_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Whether the job reached `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another attempt may still be started.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Apply an update atomically.
    ///
    /// Every check runs before the first field is written, so a rejected
    /// update leaves the job untouched.
    pub fn apply(&mut self, update: &JobUpdate) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal(self.state));
        }

        if let Some(next) = update.state {
            if !self.state.can_transition_to(next) {
                return Err(TransitionError::InvalidTransition {
                    from: self.state,
                    to: next,
                });
            }
        }

        if update.begin_attempt {
            if update.state != Some(JobState::Running) {
                return Err(TransitionError::AttemptWithoutRun);
            }
            if !self.has_attempts_left() {
                return Err(TransitionError::AttemptsExhausted {
                    attempt: self.attempt + 1,
                    max_attempts: self.max_attempts,
                });
            }
        }

        if let Some(next) = update.state {
            self.state = next;
        }
        if update.begin_attempt {
            self.attempt += 1;
        }
        if let Some(at) = update.next_run_at {
            self.next_run_at = Some(at);
        }
        if let Some(error) = &update.last_error {
            self.last_error = Some(error.clone());
        }
        if let Some(at) = update.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = update.finished_at {
            self.finished_at = Some(at);
        }

        Ok(())
    }
}

/// A partial update merged into a job snapshot.
///
/// Unset fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    /// Target state.
    pub state: Option<JobState>,
    /// Increment `attempt` (only valid together with `Running`).
    pub begin_attempt: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    /// Move into the ready queue.
    pub fn ready() -> Self {
        Self {
            state: Some(JobState::Ready),
            ..Self::default()
        }
    }

    /// Begin a new execution attempt.
    pub fn running(at: DateTime<Utc>) -> Self {
        Self {
            state: Some(JobState::Running),
            begin_attempt: true,
            started_at: Some(at),
            ..Self::default()
        }
    }

    /// Handler finished successfully.
    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            state: Some(JobState::Completed),
            finished_at: Some(at),
            ..Self::default()
        }
    }

    /// Park in the delay queue until `until`.
    pub fn delayed(until: DateTime<Utc>) -> Self {
        Self {
            state: Some(JobState::RetryWait),
            next_run_at: Some(until),
            ..Self::default()
        }
    }

    /// A failed attempt that will be retried at `until`.
    pub fn retry_wait(until: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            ..Self::delayed(until)
        }
    }

    /// Permanent failure.
    pub fn failed(at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            state: Some(JobState::Failed),
            last_error: Some(error.into()),
            finished_at: Some(at),
            ..Self::default()
        }
    }
}

/// Read-only view of a job's lifecycle, as reported by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub job_type: JobType,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            state: job.state,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            last_error: job.last_error.clone(),
            next_run_at: job.next_run_at,
            enqueued_at: job.enqueued_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}
