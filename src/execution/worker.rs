//! Worker pool executing ready jobs.
//!
//! Each worker loops on [`ReadyQueue::dequeue`], runs the registered
//! handler and records the outcome through the tracker. A failed attempt
//! that may be retried is parked in the [`DelayQueue`]; the worker never
//! sleeps through the backoff itself.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};

use crate::core::handler::{HandlerError, HandlerRegistry, JobContext, JobHandler};
use crate::core::job::{Job, JobState, JobUpdate};
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::types::{JobId, JobType};
use crate::events::{Event, EventBus};
use crate::queue::{DelayQueue, ReadyQueue};
use crate::tracker::StatusTracker;

/// Everything a worker needs to run a job.
#[derive(Clone)]
pub struct WorkerContext {
    registry: Arc<HandlerRegistry>,
    tracker: Arc<dyn StatusTracker>,
    ready: Arc<ReadyQueue>,
    delayed: Arc<DelayQueue>,
    retry_policy: RetryPolicy,
    events: Arc<EventBus>,
    busy: Arc<AtomicUsize>,
}

impl WorkerContext {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        tracker: Arc<dyn StatusTracker>,
        ready: Arc<ReadyQueue>,
        delayed: Arc<DelayQueue>,
        retry_policy: RetryPolicy,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            tracker,
            ready,
            delayed,
            retry_policy,
            events,
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share the busy-worker counter with the caller.
    pub fn with_busy_counter(mut self, busy: Arc<AtomicUsize>) -> Self {
        self.busy = busy;
        self
    }

    /// Run one attempt of `job` and record its outcome.
    ///
    /// Engine faults (tracker errors, rejected transitions) are logged and
    /// confined to this job.
    pub async fn process(&self, job: Job) {
        let id = job.id();
        let job_type = job.job_type().clone();

        let Some(entry) = self.registry.get(&job_type) else {
            let error = format!("no handler registered for job type '{}'", job_type);
            self.fail(id, &job_type, job.attempt(), error).await;
            return;
        };

        let running = match self.tracker.update(&id, JobUpdate::running(Utc::now())).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %id, job_type = %job_type, error = %e, "Could not start job");
                return;
            }
        };
        let attempt = running.attempt();
        let max_attempts = running.max_attempts();
        self.events
            .emit(Event::job_started(id, job_type.clone(), attempt))
            .await;

        let ctx = JobContext {
            job_id: id,
            job_type: job_type.clone(),
            attempt,
            max_attempts,
            payload: running.payload().clone(),
            correlation_id: running.correlation_id().map(String::from),
        };
        let started = Instant::now();
        let result = run_handler(Arc::clone(&entry.handler), ctx, entry.options.timeout).await;
        let elapsed = started.elapsed();

        let error = match result {
            Ok(()) => {
                match self.tracker.update(&id, JobUpdate::completed(Utc::now())).await {
                    Ok(_) => {
                        self.events
                            .emit(Event::job_completed(id, job_type, attempt, elapsed))
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %id, error = %e, "Could not record completion");
                    }
                }
                return;
            }
            Err(error) => error,
        };

        let policy = entry
            .options
            .retry_policy
            .as_ref()
            .unwrap_or(&self.retry_policy);

        match policy.evaluate(attempt, max_attempts, &error) {
            RetryDecision::Retry { .. } if self.ready.is_closed() => {
                let error = format!("engine shut down before retry: {}", error);
                self.fail(id, &job_type, attempt, error).await;
            }
            RetryDecision::Retry { delay } => {
                let until = due_after(Utc::now(), delay);
                let message = error.to_string();
                match self
                    .tracker
                    .update(&id, JobUpdate::retry_wait(until, message.clone()))
                    .await
                {
                    Ok(snapshot) => {
                        self.delayed.schedule(snapshot, until);
                        self.events
                            .emit(Event::job_retrying(
                                id,
                                job_type,
                                attempt,
                                max_attempts,
                                delay,
                                message,
                            ))
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %id, error = %e, "Could not park job for retry");
                    }
                }
            }
            RetryDecision::GiveUp => {
                self.fail(id, &job_type, attempt, error.to_string()).await;
            }
        }
    }

    /// Move a job whose processing died to `Failed`.
    ///
    /// Jobs that already finished or were parked for a retry are left alone.
    async fn abandon(&self, id: JobId, job_type: &JobType, attempt: u32, error: String) {
        match self.tracker.get(&id).await {
            Ok(Some(job)) if job.is_terminal() || job.state() == JobState::RetryWait => {}
            Ok(Some(job)) => {
                self.fail(id, job_type, job.attempt().max(attempt), error)
                    .await
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Could not look up abandoned job");
            }
        }
    }

    async fn fail(&self, id: JobId, job_type: &JobType, attempt: u32, error: String) {
        match self
            .tracker
            .update(&id, JobUpdate::failed(Utc::now(), error.clone()))
            .await
        {
            Ok(_) => {
                self.events
                    .emit(Event::job_failed(id, job_type.clone(), attempt, error))
                    .await;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Could not record failure");
            }
        }
    }
}

/// Run the handler in its own task so a panic stays inside this attempt.
async fn run_handler(
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    timeout: Option<Duration>,
) -> Result<(), HandlerError> {
    let mut task = tokio::spawn(async move { handler.handle(&ctx).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(HandlerError::Timeout(limit));
            }
        },
        None => task.await,
    };

    joined.unwrap_or_else(|e| Err(join_error(e)))
}

fn join_error(error: JoinError) -> HandlerError {
    if error.is_panic() {
        HandlerError::Panicked(panic_message(error.into_panic()))
    } else {
        HandlerError::failed("handler task was cancelled")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Fixed-size pool of worker tasks sharing one ready queue.
pub struct WorkerPool {
    size: usize,
    context: WorkerContext,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool of `size` workers (at least one).
    pub fn new(size: usize, context: WorkerContext) -> Self {
        Self {
            size: size.max(1),
            context,
            handles: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the worker loops are currently spawned.
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Number of workers currently executing a job.
    pub fn busy(&self) -> usize {
        self.context.busy.load(Ordering::SeqCst)
    }

    /// A shared counter of busy workers.
    pub fn busy_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.context.busy)
    }

    /// Spawn the worker loops.
    pub fn start(&mut self) {
        if self.is_running() {
            tracing::warn!("Worker pool already started");
            return;
        }
        for worker_id in 0..self.size {
            let context = self.context.clone();
            self.handles.push(tokio::spawn(worker_loop(worker_id, context)));
        }
        tracing::info!(workers = self.size, "Worker pool started");
    }

    /// Close the ready queue and wait for every worker to finish its job.
    ///
    /// Returns `false` if the workers did not stop within `timeout`; they
    /// keep running detached in that case.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        self.context.ready.close();
        let handles = std::mem::take(&mut self.handles);

        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Worker task ended abnormally");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                tracing::info!("Worker pool stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    busy = self.busy(),
                    "Workers did not stop in time, leaving them detached"
                );
                false
            }
        }
    }
}

async fn worker_loop(worker_id: usize, context: WorkerContext) {
    tracing::debug!(worker_id, "Worker started");
    while let Some(job) = context.ready.dequeue().await {
        context.busy.fetch_add(1, Ordering::SeqCst);
        let id = job.id();
        let job_type = job.job_type().clone();
        let attempt = job.attempt();
        let task = {
            let context = context.clone();
            tokio::spawn(async move { context.process(job).await })
        };
        if let Err(e) = task.await {
            tracing::error!(worker_id, job_id = %id, error = %e, "Job processing aborted");
            let error = if e.is_panic() {
                format!("job processing panicked: {}", panic_message(e.into_panic()))
            } else {
                "job processing was cancelled".to_string()
            };
            context.abandon(id, &job_type, attempt, error).await;
        }
        context.busy.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!(worker_id, "Worker stopped");
}
