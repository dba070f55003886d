//! In-memory tracker implementation.
//!
//! Provides a thread-safe in-memory backend for the job engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{JobFilter, StateCounts, StatusTracker, TrackerError};
use crate::core::job::{Job, JobUpdate};
use crate::core::types::JobId;

/// In-memory tracker backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryTracker {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryTracker {
    /// Create a new empty in-memory tracker.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusTracker for InMemoryTracker {
    async fn track(&self, job: Job) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.write().map_err(|_| TrackerError::LockPoisoned)?;
        if jobs.contains_key(&job.id()) {
            return Err(TrackerError::DuplicateJob(job.id()));
        }
        jobs.insert(job.id(), job);
        Ok(())
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Job, TrackerError> {
        let mut jobs = self.jobs.write().map_err(|_| TrackerError::LockPoisoned)?;
        let job = jobs.get_mut(id).ok_or(TrackerError::NotFound(*id))?;
        job.apply(&update)
            .map_err(|source| TrackerError::InvalidTransition { id: *id, source })?;
        Ok(job.clone())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, TrackerError> {
        let jobs = self.jobs.read().map_err(|_| TrackerError::LockPoisoned)?;
        Ok(jobs.get(id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, TrackerError> {
        let jobs = self.jobs.read().map_err(|_| TrackerError::LockPoisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by_key(|j| j.enqueued_at());
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn counts(&self) -> Result<StateCounts, TrackerError> {
        let jobs = self.jobs.read().map_err(|_| TrackerError::LockPoisoned)?;
        let mut counts = StateCounts::default();
        for job in jobs.values() {
            counts.record(job.state());
        }
        Ok(counts)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, TrackerError> {
        let mut jobs = self.jobs.write().map_err(|_| TrackerError::LockPoisoned)?;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.is_terminal() && job.finished_at().is_some_and(|at| at < cutoff))
        });
        Ok(before - jobs.len())
    }
}
