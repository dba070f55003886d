//! Status tracking for submitted jobs.
//!
//! This module provides a trait-based store for job lifecycle snapshots
//! with an in-memory backend. Every state change made by workers, the
//! promoter and the engine goes through [`StatusTracker::update`].

mod memory;

pub use memory::InMemoryTracker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::job::{Job, JobState, JobUpdate, TransitionError};
use crate::core::types::{JobId, JobType};

/// Errors that can occur during tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The requested job was not found.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A job with the same id is already tracked.
    #[error("duplicate job: {0}")]
    DuplicateJob(JobId),

    /// The update violates the job state machine.
    #[error("rejected update for job {id}: {source}")]
    InvalidTransition {
        id: JobId,
        #[source]
        source: TransitionError,
    },

    /// Tracker lock was poisoned.
    #[error("tracker lock poisoned")]
    LockPoisoned,

    /// Generic backend error.
    #[error("tracker error: {0}")]
    Other(String),
}

/// Selection criteria for [`StatusTracker::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<JobType>,
    pub correlation_id: Option<String>,
    /// Maximum number of jobs returned (None = unlimited).
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Match every job.
    pub fn all() -> Self {
        Self::default()
    }

    /// Builder: only jobs in `state`.
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Builder: only jobs of `job_type`.
    pub fn with_job_type(mut self, job_type: impl Into<JobType>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Builder: only jobs sharing a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Builder: cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `job` satisfies every set criterion.
    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| job.state() == s)
            && self.job_type.as_ref().is_none_or(|t| job.job_type() == t)
            && self
                .correlation_id
                .as_deref()
                .is_none_or(|c| job.correlation_id() == Some(c))
    }
}

/// Number of tracked jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    counts: HashMap<JobState, usize>,
}

impl StateCounts {
    /// Count of jobs in `state`.
    pub fn get(&self, state: JobState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// Add one job in `state`.
    pub fn record(&mut self, state: JobState) {
        *self.counts.entry(state).or_insert(0) += 1;
    }

    /// Total number of tracked jobs.
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Jobs that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        JobState::ALL
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| self.get(*s))
            .sum()
    }
}

/// Store of job lifecycle snapshots.
///
/// Implementations must apply each update atomically: concurrent writers
/// never lose an update, and readers never see a half-applied one.
#[async_trait]
pub trait StatusTracker: Send + Sync {
    /// Record the initial snapshot of a new job.
    async fn track(&self, job: Job) -> Result<(), TrackerError>;

    /// Validate and merge `update` into the stored snapshot.
    ///
    /// Returns the snapshot as it is after the update.
    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Job, TrackerError>;

    /// Get a copy of the current snapshot.
    async fn get(&self, id: &JobId) -> Result<Option<Job>, TrackerError>;

    /// List snapshots matching `filter`, oldest submission first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, TrackerError>;

    /// Number of jobs per state.
    async fn counts(&self) -> Result<StateCounts, TrackerError>;

    /// Remove terminal jobs that finished before `cutoff`.
    ///
    /// Jobs that are still pending, queued or running are never removed.
    /// Returns the number of removed snapshots.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, TrackerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_filter_matches() {
        let job = Job::new("email", Value::Null, 1).with_correlation_id("batch-1");

        assert!(JobFilter::all().matches(&job));
        assert!(JobFilter::all().with_state(JobState::Pending).matches(&job));
        assert!(!JobFilter::all().with_state(JobState::Ready).matches(&job));
        assert!(JobFilter::all().with_job_type("email").matches(&job));
        assert!(!JobFilter::all().with_job_type("resize").matches(&job));
        assert!(JobFilter::all().with_correlation_id("batch-1").matches(&job));
        assert!(!JobFilter::all().with_correlation_id("batch-2").matches(&job));
    }

    #[test]
    fn test_state_counts() {
        let mut counts = StateCounts::default();
        counts.record(JobState::Ready);
        counts.record(JobState::Ready);
        counts.record(JobState::Completed);

        assert_eq!(counts.get(JobState::Ready), 2);
        assert_eq!(counts.get(JobState::Failed), 0);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.in_flight(), 2);
    }
}
