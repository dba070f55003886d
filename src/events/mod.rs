//! Lifecycle events and event handling.
//!
//! This module provides event emission for job lifecycle transitions and
//! schedule firings, enabling observability into the engine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{JobId, JobType, ScheduleId};

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job was accepted by `submit`.
    JobSubmitted {
        job_id: JobId,
        job_type: JobType,
        timestamp: Instant,
    },

    /// A worker started an attempt.
    JobStarted {
        job_id: JobId,
        job_type: JobType,
        /// 1-indexed attempt number.
        attempt: u32,
        timestamp: Instant,
    },

    /// The handler returned successfully.
    JobCompleted {
        job_id: JobId,
        job_type: JobType,
        attempt: u32,
        duration: Duration,
        timestamp: Instant,
    },

    /// An attempt failed and the job was parked for a retry.
    JobRetrying {
        job_id: JobId,
        job_type: JobType,
        /// The attempt number that just failed.
        attempt: u32,
        max_attempts: u32,
        /// Backoff before the job becomes ready again.
        delay: Duration,
        error: String,
        timestamp: Instant,
    },

    /// The job reached `Failed` and will not run again.
    JobFailed {
        job_id: JobId,
        job_type: JobType,
        /// Attempts consumed, 0 when no handler was registered.
        attempt: u32,
        error: String,
        timestamp: Instant,
    },

    /// A schedule fired and submitted a job.
    ScheduleFired {
        schedule_id: ScheduleId,
        job_id: JobId,
        job_type: JobType,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobSubmitted { timestamp, .. } => *timestamp,
            Event::JobStarted { timestamp, .. } => *timestamp,
            Event::JobCompleted { timestamp, .. } => *timestamp,
            Event::JobRetrying { timestamp, .. } => *timestamp,
            Event::JobFailed { timestamp, .. } => *timestamp,
            Event::ScheduleFired { timestamp, .. } => *timestamp,
        }
    }

    /// The job this event refers to.
    pub fn job_id(&self) -> JobId {
        match self {
            Event::JobSubmitted { job_id, .. }
            | Event::JobStarted { job_id, .. }
            | Event::JobCompleted { job_id, .. }
            | Event::JobRetrying { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::ScheduleFired { job_id, .. } => *job_id,
        }
    }

    /// Short name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::JobSubmitted { .. } => "job_submitted",
            Event::JobStarted { .. } => "job_started",
            Event::JobCompleted { .. } => "job_completed",
            Event::JobRetrying { .. } => "job_retrying",
            Event::JobFailed { .. } => "job_failed",
            Event::ScheduleFired { .. } => "schedule_fired",
        }
    }

    /// Create a JobSubmitted event.
    pub fn job_submitted(job_id: JobId, job_type: JobType) -> Self {
        Event::JobSubmitted {
            job_id,
            job_type,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobStarted event.
    pub fn job_started(job_id: JobId, job_type: JobType, attempt: u32) -> Self {
        Event::JobStarted {
            job_id,
            job_type,
            attempt,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobCompleted event.
    pub fn job_completed(job_id: JobId, job_type: JobType, attempt: u32, duration: Duration) -> Self {
        Event::JobCompleted {
            job_id,
            job_type,
            attempt,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobRetrying event.
    pub fn job_retrying(
        job_id: JobId,
        job_type: JobType,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    ) -> Self {
        Event::JobRetrying {
            job_id,
            job_type,
            attempt,
            max_attempts,
            delay,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobFailed event.
    pub fn job_failed(job_id: JobId, job_type: JobType, attempt: u32, error: String) -> Self {
        Event::JobFailed {
            job_id,
            job_type,
            attempt,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a ScheduleFired event.
    pub fn schedule_fired(schedule_id: ScheduleId, job_id: JobId, job_type: JobType) -> Self {
        Event::ScheduleFired {
            schedule_id,
            job_id,
            job_type,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    ///
    /// Each handler runs in its own task. A panicking handler is logged and
    /// the remaining handlers still receive the event.
    pub async fn emit(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = self.handlers.read().await.clone();
        for handler in handlers {
            let event = event.clone();
            let kind = event.kind();
            let delivered = tokio::spawn(async move { handler.handle(&event).await }).await;
            if let Err(e) = delivered {
                tracing::error!(event = kind, error = %e, "Event handler panicked");
            }
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event handler that writes every event to the `tracing` log.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobSubmitted {
                job_id, job_type, ..
            } => {
                tracing::debug!(job_id = %job_id, job_type = %job_type, "Job submitted");
            }
            Event::JobStarted {
                job_id,
                job_type,
                attempt,
                ..
            } => {
                tracing::info!(job_id = %job_id, job_type = %job_type, attempt, "Job started");
            }
            Event::JobCompleted {
                job_id,
                job_type,
                attempt,
                duration,
                ..
            } => {
                tracing::info!(
                    job_id = %job_id,
                    job_type = %job_type,
                    attempt,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
            }
            Event::JobRetrying {
                job_id,
                job_type,
                attempt,
                max_attempts,
                delay,
                error,
                ..
            } => {
                tracing::warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job attempt failed, retrying"
                );
            }
            Event::JobFailed {
                job_id,
                job_type,
                attempt,
                error,
                ..
            } => {
                tracing::error!(
                    job_id = %job_id,
                    job_type = %job_type,
                    attempt,
                    error = %error,
                    "Job failed"
                );
            }
            Event::ScheduleFired {
                schedule_id,
                job_id,
                job_type,
                ..
            } => {
                tracing::info!(
                    schedule_id = %schedule_id,
                    job_id = %job_id,
                    job_type = %job_type,
                    "Schedule fired"
                );
            }
        }
    }
}
