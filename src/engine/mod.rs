//! The job engine facade.
//!
//! [`Engine`] wires the handler registry, status tracker, queues, worker
//! pool, promoter and scheduler together. Build one with
//! [`EngineBuilder`] or [`Engine::from_config`], register handlers, call
//! [`Engine::start`] and submit work.
//!
//! # Example
//!
//! ```ignore
//! use hopper::{Engine, HandlerError, JobContext, SubmitOptions};
//! use serde_json::json;
//!
//! let engine = Engine::builder().with_workers(4).build()?;
//! engine.register_fn("send_email", |ctx: JobContext| async move {
//!     let to: String = ctx.payload_as()?;
//!     // deliver...
//!     Ok(())
//! })?;
//! engine.start()?;
//!
//! let id = engine
//!     .submit("send_email", json!("a@example.com"), SubmitOptions::default())
//!     .await?;
//! let status = engine.wait_for(id, std::time::Duration::from_secs(5)).await?;
//! engine.shutdown().await?;
//! ```

mod dispatch;

pub use dispatch::Dispatcher;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, EngineConfig, YamlLoader};
use crate::core::handler::{
    HandlerError, HandlerOptions, HandlerRegistry, JobContext, JobHandler, RegistryError,
};
use crate::core::job::{Job, JobState, JobStatus};
use crate::core::retry::RetryPolicy;
use crate::core::schedule::{Schedule, ScheduleError};
use crate::core::types::{JobId, JobType, ScheduleId};
use crate::events::EventBus;
use crate::execution::{WorkerContext, WorkerPool};
use crate::queue::{DelayQueue, Promoter, ReadyQueue};
use crate::scheduler::{
    ScheduleInfo, ScheduleOptions, Scheduler, SchedulerError, SchedulerHandle,
};
use crate::tracker::{InMemoryTracker, JobFilter, StateCounts, StatusTracker, TrackerError};

/// Default number of worker tasks.
pub const DEFAULT_WORKERS: usize = 4;

/// Default max attempts for jobs that do not set their own.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default time shutdown waits for running jobs.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors returned by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine no longer accepts work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// The operation needs a started engine.
    #[error("engine is not started")]
    NotStarted,

    /// `start` was called twice.
    #[error("engine already started")]
    AlreadyStarted,

    /// No job with this id is tracked.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// `wait_for` gave up before the job finished.
    #[error("timed out waiting for job {0}")]
    WaitTimeout(JobId),

    /// `max_attempts` must be at least 1.
    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    /// The requested delay does not fit in a timestamp.
    #[error("delay out of range: {0:?}")]
    InvalidDelay(Duration),

    /// Invalid builder setting.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Per-submission settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Overrides the handler and engine defaults.
    pub max_attempts: Option<u32>,
    /// Hold the job back for this long before it becomes ready.
    pub delay: Option<Duration>,
    /// Groups related jobs, e.g. the steps of a workflow.
    pub correlation_id: Option<String>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set max attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Builder: defer the first attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Builder: set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// What was left unfinished when the engine stopped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Jobs still waiting in the ready queue.
    pub ready: Vec<JobId>,
    /// Jobs still waiting for a retry or deferred start.
    pub delayed: Vec<JobId>,
    /// Jobs whose handler had not returned when the timeout expired.
    pub running: Vec<JobId>,
    /// Whether every worker stopped within the shutdown timeout.
    pub workers_stopped: bool,
    /// Per-state totals at the time of the report.
    pub counts: StateCounts,
}

impl ShutdownReport {
    /// Whether no job was left behind.
    pub fn is_clean(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.running.is_empty()
    }
}

/// Point-in-time engine metrics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub workers: usize,
    /// Workers currently executing a handler.
    pub busy_workers: usize,
    /// Jobs in the ready queue.
    pub ready_queue: usize,
    /// Jobs in the delay queue.
    pub delay_queue: usize,
    pub counts: StateCounts,
}

struct PendingSchedule {
    job_type: JobType,
    payload: Value,
    schedule: Schedule,
    options: ScheduleOptions,
}

/// Background tasks owned by a started engine.
struct Running {
    pool: WorkerPool,
    promoter: JoinHandle<()>,
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
}

enum Lifecycle {
    Idle(Vec<PendingSchedule>),
    Running(Box<Running>),
    Stopped,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    registry: Option<Arc<HandlerRegistry>>,
    tracker: Option<Arc<dyn StatusTracker>>,
    event_bus: Option<Arc<EventBus>>,
    retry_policy: RetryPolicy,
    workers: usize,
    default_max_attempts: u32,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    schedules: Vec<PendingSchedule>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            tracker: None,
            event_bus: None,
            retry_policy: RetryPolicy::default(),
            workers: DEFAULT_WORKERS,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            tick_interval: DEFAULT_TICK_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            schedules: Vec::new(),
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder from a validated configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        YamlLoader::validate_engine_config(config)?;

        let mut builder = Self::new()
            .with_workers(config.workers)
            .with_default_max_attempts(config.default_max_attempts)
            .with_retry_policy(config.retry.to_policy())
            .with_tick_interval(config.tick_interval)
            .with_shutdown_timeout(config.shutdown_timeout);

        for entry in &config.schedules {
            let schedule = entry
                .to_schedule()
                .map_err(|source| ConfigError::InvalidSchedule {
                    job_type: entry.job_type.clone(),
                    source,
                })?;
            builder = builder.with_schedule(
                entry.job_type.as_str(),
                entry.payload.clone(),
                schedule,
                entry.options(),
            );
        }
        Ok(builder)
    }

    /// Use an existing handler registry.
    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a custom status tracker (default: in-memory).
    pub fn with_tracker(mut self, tracker: Arc<dyn StatusTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Set the engine-wide retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the number of worker tasks.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the max attempts for jobs that do not set their own.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Set the scheduler tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Add a schedule that starts with the engine.
    pub fn with_schedule(
        mut self,
        job_type: impl Into<JobType>,
        payload: Value,
        schedule: Schedule,
        options: ScheduleOptions,
    ) -> Self {
        self.schedules.push(PendingSchedule {
            job_type: job_type.into(),
            payload,
            schedule,
            options,
        });
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine, EngineError> {
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        if self.default_max_attempts == 0 {
            return Err(EngineError::InvalidMaxAttempts);
        }
        if self.tick_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "tick_interval must be greater than zero".into(),
            ));
        }

        let registry = self.registry.unwrap_or_default();
        let tracker = self
            .tracker
            .unwrap_or_else(|| Arc::new(InMemoryTracker::new()));
        let events = self.event_bus.unwrap_or_default();
        let ready = Arc::new(ReadyQueue::new());
        let delayed = Arc::new(DelayQueue::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&ready),
            Arc::clone(&delayed),
            Arc::clone(&events),
            self.default_max_attempts,
        ));

        Ok(Engine {
            registry,
            tracker,
            events,
            ready,
            delayed,
            dispatcher,
            retry_policy: self.retry_policy,
            workers: self.workers,
            tick_interval: self.tick_interval,
            shutdown_timeout: self.shutdown_timeout,
            busy: Arc::new(AtomicUsize::new(0)),
            lifecycle: Mutex::new(Lifecycle::Idle(self.schedules)),
            shutdown_gate: tokio::sync::Mutex::new(None),
        })
    }
}

/// An in-process asynchronous job engine.
pub struct Engine {
    registry: Arc<HandlerRegistry>,
    tracker: Arc<dyn StatusTracker>,
    events: Arc<EventBus>,
    ready: Arc<ReadyQueue>,
    delayed: Arc<DelayQueue>,
    dispatcher: Arc<Dispatcher>,
    retry_policy: RetryPolicy,
    workers: usize,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    busy: Arc<AtomicUsize>,
    lifecycle: Mutex<Lifecycle>,
    /// Held for the whole wind-down; records whether workers stopped in time.
    shutdown_gate: tokio::sync::Mutex<Option<bool>>,
}

impl Engine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Build an engine from a configuration file's contents.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::from_config(config)?.build()
    }

    /// The handler registry.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// The status tracker.
    pub fn tracker(&self) -> &Arc<dyn StatusTracker> {
        &self.tracker
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register a handler with default options.
    pub fn register(
        &self,
        job_type: impl Into<JobType>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), EngineError> {
        Ok(self.registry.register(job_type, handler)?)
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, job_type: impl Into<JobType>, f: F) -> Result<(), EngineError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Ok(self.registry.register_fn(job_type, f)?)
    }

    /// Register a handler with explicit options.
    pub fn register_with(
        &self,
        job_type: impl Into<JobType>,
        handler: Arc<dyn JobHandler>,
        options: HandlerOptions,
    ) -> Result<(), EngineError> {
        Ok(self.registry.register_with(job_type, handler, options)?)
    }

    /// Submit a job.
    ///
    /// Jobs submitted before [`Engine::start`] wait in the queues until the
    /// workers run.
    pub async fn submit(
        &self,
        job_type: impl Into<JobType>,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<JobId, EngineError> {
        self.dispatcher
            .submit(job_type.into(), payload, options, None)
            .await
    }

    /// Current status of a job.
    pub async fn status(&self, id: JobId) -> Result<Option<JobStatus>, EngineError> {
        Ok(self.tracker.get(&id).await?.as_ref().map(JobStatus::from))
    }

    /// Full snapshot of a job, including its payload.
    pub async fn job(&self, id: JobId) -> Result<Option<Job>, EngineError> {
        Ok(self.tracker.get(&id).await?)
    }

    /// Jobs matching `filter`.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobStatus>, EngineError> {
        let jobs = self.tracker.list(filter).await?;
        Ok(jobs.iter().map(JobStatus::from).collect())
    }

    /// Wait until the job reaches `Completed` or `Failed`.
    pub async fn wait_for(&self, id: JobId, timeout: Duration) -> Result<JobStatus, EngineError> {
        let poll = async {
            loop {
                match self.tracker.get(&id).await? {
                    Some(job) if job.is_terminal() => return Ok(JobStatus::from(&job)),
                    Some(_) => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
                    None => return Err(EngineError::JobNotFound(id)),
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| EngineError::WaitTimeout(id))?
    }

    /// Point-in-time metrics.
    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            workers: self.workers,
            busy_workers: self.busy.load(Ordering::SeqCst),
            ready_queue: self.ready.len(),
            delay_queue: self.delayed.len(),
            counts: self.tracker.counts().await?,
        })
    }

    /// Forget terminal jobs that finished before `cutoff`.
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
        let removed = self.tracker.prune(cutoff).await?;
        tracing::debug!(removed, cutoff = %cutoff, "Pruned finished jobs");
        Ok(removed)
    }

    /// Whether `start` has run and `shutdown` has not.
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_lifecycle(), Lifecycle::Running(_))
    }

    /// Spawn the promoter, the worker pool and the scheduler.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lock_lifecycle();
        let pending = match &mut *lifecycle {
            Lifecycle::Idle(pending) => std::mem::take(pending),
            Lifecycle::Running(_) => return Err(EngineError::AlreadyStarted),
            Lifecycle::Stopped => return Err(EngineError::ShuttingDown),
        };

        let mut scheduler = Scheduler::new(Arc::clone(&self.dispatcher))
            .with_event_bus(Arc::clone(&self.events))
            .with_tick_interval(self.tick_interval);
        for entry in pending {
            scheduler.add(entry.job_type, entry.payload, entry.schedule, entry.options)?;
        }

        let promoter = Promoter::new(
            Arc::clone(&self.delayed),
            Arc::clone(&self.ready),
            Arc::clone(&self.tracker),
        )
        .spawn();

        let context = WorkerContext::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.tracker),
            Arc::clone(&self.ready),
            Arc::clone(&self.delayed),
            self.retry_policy.clone(),
            Arc::clone(&self.events),
        )
        .with_busy_counter(Arc::clone(&self.busy));
        let mut pool = WorkerPool::new(self.workers, context);
        pool.start();

        let schedules = scheduler.len();
        let (scheduler_handle, scheduler_task) = scheduler.start();

        *lifecycle = Lifecycle::Running(Box::new(Running {
            pool,
            promoter,
            scheduler: scheduler_handle,
            scheduler_task,
        }));
        tracing::info!(
            workers = self.workers,
            schedules,
            handlers = self.registry.len(),
            "Engine started"
        );
        Ok(())
    }

    /// Stop accepting work and wind down.
    ///
    /// Order: scheduler, workers (bounded by the shutdown timeout), promoter.
    /// Running handlers are allowed to finish; queued and delayed jobs stay
    /// where they are and are listed in the report.
    ///
    /// Calling it again, or concurrently, waits for the first wind-down to
    /// finish and then reports the current state.
    pub async fn shutdown(&self) -> Result<ShutdownReport, EngineError> {
        let mut gate = self.shutdown_gate.lock().await;
        if let Some(workers_stopped) = *gate {
            return self.report(workers_stopped).await;
        }

        self.dispatcher.close();
        let previous = std::mem::replace(&mut *self.lock_lifecycle(), Lifecycle::Stopped);

        let mut workers_stopped = true;
        if let Lifecycle::Running(running) = previous {
            let Running {
                mut pool,
                promoter,
                scheduler,
                scheduler_task,
            } = *running;

            if let Err(e) = scheduler.shutdown().await {
                tracing::warn!(error = %e, "Scheduler did not acknowledge shutdown");
            }
            if let Err(e) = scheduler_task.await {
                tracing::error!(error = %e, "Scheduler task ended abnormally");
            }

            workers_stopped = pool.stop(self.shutdown_timeout).await;

            self.delayed.close();
            if let Err(e) = promoter.await {
                tracing::error!(error = %e, "Promoter task ended abnormally");
            }
        } else {
            self.ready.close();
            self.delayed.close();
        }

        *gate = Some(workers_stopped);
        let report = self.report(workers_stopped).await?;
        tracing::info!(
            ready = report.ready.len(),
            delayed = report.delayed.len(),
            running = report.running.len(),
            workers_stopped,
            "Engine stopped"
        );
        Ok(report)
    }

    async fn report(&self, workers_stopped: bool) -> Result<ShutdownReport, EngineError> {
        let ids = |jobs: Vec<Job>| jobs.iter().map(Job::id).collect::<Vec<_>>();
        Ok(ShutdownReport {
            ready: ids(self
                .tracker
                .list(&JobFilter::all().with_state(JobState::Ready))
                .await?),
            delayed: ids(self
                .tracker
                .list(&JobFilter::all().with_state(JobState::RetryWait))
                .await?),
            running: ids(self
                .tracker
                .list(&JobFilter::all().with_state(JobState::Running))
                .await?),
            workers_stopped,
            counts: self.tracker.counts().await?,
        })
    }

    fn scheduler(&self) -> Result<SchedulerHandle, EngineError> {
        match &*self.lock_lifecycle() {
            Lifecycle::Running(running) => Ok(running.scheduler.clone()),
            Lifecycle::Idle(_) => Err(EngineError::NotStarted),
            Lifecycle::Stopped => Err(EngineError::ShuttingDown),
        }
    }

    /// Submit `job_type` every `interval`.
    pub async fn schedule_periodic(
        &self,
        job_type: impl Into<JobType>,
        payload: Value,
        interval: Duration,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, EngineError> {
        Ok(self
            .scheduler()?
            .schedule_periodic(job_type, payload, interval, options)
            .await?)
    }

    /// Submit `job_type` at every match of a cron expression.
    pub async fn schedule_cron(
        &self,
        job_type: impl Into<JobType>,
        payload: Value,
        expression: &str,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, EngineError> {
        Ok(self
            .scheduler()?
            .schedule_cron(job_type, payload, expression, options)
            .await?)
    }

    /// Submit `job_type` at every occurrence of `schedule`.
    pub async fn schedule(
        &self,
        job_type: impl Into<JobType>,
        payload: Value,
        schedule: Schedule,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, EngineError> {
        Ok(self
            .scheduler()?
            .schedule(job_type, payload, schedule, options)
            .await?)
    }

    /// Stop a schedule. Jobs it already submitted are unaffected.
    pub async fn cancel_schedule(&self, id: ScheduleId) -> Result<(), EngineError> {
        Ok(self.scheduler()?.cancel(id).await?)
    }

    /// Registered schedules.
    pub async fn schedules(&self) -> Result<Vec<ScheduleInfo>, EngineError> {
        Ok(self.scheduler()?.list().await?)
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
