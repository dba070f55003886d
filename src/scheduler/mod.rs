//! Recurring job submission.
//!
//! This module provides the scheduling loop that submits jobs at the
//! occurrences of interval and cron schedules.

mod engine;
mod handle;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{
    JobSubmitter, ScheduleInfo, ScheduleOptions, ScheduledJob, SchedulerError, SchedulerState,
};
