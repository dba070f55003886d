//! Job submission.
//!
//! The dispatcher turns a submission into a tracked job and places it in
//! the right queue. It is shared by the engine facade and the scheduler.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{EngineError, SubmitOptions};
use crate::core::handler::HandlerRegistry;
use crate::core::job::{Job, JobUpdate};
use crate::core::types::{JobId, JobType, ScheduleId};
use crate::events::{Event, EventBus};
use crate::queue::{DelayQueue, ReadyQueue};
use crate::scheduler::{JobSubmitter, ScheduledJob};
use crate::tracker::StatusTracker;

/// Accepts jobs and routes them to the ready or delay queue.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    tracker: Arc<dyn StatusTracker>,
    ready: Arc<ReadyQueue>,
    delayed: Arc<DelayQueue>,
    events: Arc<EventBus>,
    default_max_attempts: u32,
    accepting: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        tracker: Arc<dyn StatusTracker>,
        ready: Arc<ReadyQueue>,
        delayed: Arc<DelayQueue>,
        events: Arc<EventBus>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            tracker,
            ready,
            delayed,
            events,
            default_max_attempts: default_max_attempts.max(1),
            accepting: AtomicBool::new(true),
        }
    }

    /// Reject every later submission.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Track a new job and queue it.
    ///
    /// A job whose type has no handler is recorded as `Failed` with no
    /// attempt consumed; its id is still returned.
    pub async fn submit(
        &self,
        job_type: JobType,
        payload: Value,
        options: SubmitOptions,
        schedule_id: Option<ScheduleId>,
    ) -> Result<JobId, EngineError> {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        if options.max_attempts == Some(0) {
            return Err(EngineError::InvalidMaxAttempts);
        }

        let run_at = match options.delay.filter(|d| !d.is_zero()) {
            Some(delay) => Some(
                chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .ok_or(EngineError::InvalidDelay(delay))?,
            ),
            None => None,
        };

        let handler = self.registry.get(&job_type);
        let max_attempts = options
            .max_attempts
            .or_else(|| handler.as_ref().and_then(|h| h.options.max_attempts))
            .unwrap_or(self.default_max_attempts);

        let mut job = Job::new(job_type.clone(), payload, max_attempts);
        if let Some(correlation_id) = options.correlation_id {
            job = job.with_correlation_id(correlation_id);
        }
        if let Some(schedule_id) = schedule_id {
            job = job.with_schedule_id(schedule_id);
        }
        let id = job.id();

        self.tracker.track(job).await?;
        self.events
            .emit(Event::job_submitted(id, job_type.clone()))
            .await;

        if handler.is_none() {
            let error = format!("no handler registered for job type '{}'", job_type);
            tracing::warn!(job_id = %id, job_type = %job_type, "Rejected job with unknown type");
            self.tracker
                .update(&id, JobUpdate::failed(Utc::now(), error.clone()))
                .await?;
            self.events
                .emit(Event::job_failed(id, job_type, 0, error))
                .await;
            return Ok(id);
        }

        match run_at {
            Some(until) => {
                let snapshot = self.tracker.update(&id, JobUpdate::delayed(until)).await?;
                self.delayed.schedule(snapshot, until);
                tracing::debug!(job_id = %id, job_type = %job_type, run_at = %until, "Job deferred");
            }
            None => {
                let snapshot = self.tracker.update(&id, JobUpdate::ready()).await?;
                self.ready.enqueue(snapshot);
                tracing::debug!(job_id = %id, job_type = %job_type, max_attempts, "Job queued");
            }
        }

        Ok(id)
    }
}

#[async_trait]
impl JobSubmitter for Dispatcher {
    type Error = EngineError;

    async fn submit_scheduled(&self, job: ScheduledJob) -> Result<JobId, EngineError> {
        let options = SubmitOptions {
            max_attempts: job.max_attempts,
            delay: None,
            correlation_id: job.correlation_id,
        };
        self.submit(job.job_type, job.payload, options, Some(job.schedule_id))
            .await
    }

    async fn is_active(&self, id: &JobId) -> bool {
        match self.tracker.get(id).await {
            Ok(Some(job)) => !job.is_terminal(),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Could not look up job, assuming it is active");
                true
            }
        }
    }
}
