//! hopper - an in-process asynchronous job engine.
//!
//! Jobs are typed payloads dispatched to registered handlers by a pool of
//! workers. Failed attempts are retried with backoff through a delay queue,
//! every state change is recorded by a [`StatusTracker`], and a scheduler
//! submits recurring jobs from interval or cron schedules.

pub mod config;
pub mod core;
pub mod engine;
pub mod events;
pub mod execution;
pub mod queue;
pub mod scheduler;
pub mod testing;
pub mod tracker;

pub use config::{ConfigError, EngineConfig, RetryConfig, ScheduleConfig, YamlLoader};
pub use crate::core::handler::{
    FnHandler, HandlerError, HandlerOptions, HandlerRegistry, JobContext, JobHandler,
    RegistryError,
};
pub use crate::core::job::{Job, JobState, JobStatus, JobUpdate, TransitionError};
pub use crate::core::pipeline::Pipeline;
pub use crate::core::retry::{Backoff, RetryCondition, RetryDecision, RetryPolicy};
pub use crate::core::schedule::{Schedule, ScheduleError};
pub use crate::core::types::{JobId, JobType, ScheduleId};
pub use engine::{
    Engine, EngineBuilder, EngineError, EngineStats, ShutdownReport, SubmitOptions,
};
pub use events::{Event, EventBus, EventHandler, LoggingEventHandler};
pub use scheduler::{ScheduleInfo, ScheduleOptions, SchedulerError, SchedulerState};
pub use tracker::{InMemoryTracker, JobFilter, StateCounts, StatusTracker, TrackerError};
