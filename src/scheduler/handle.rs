//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of the scheduler through commands like schedule, cancel, pause, resume, and
//! shutdown.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::schedule::Schedule;
use crate::core::types::{JobType, ScheduleId};

use super::types::{
    ScheduleEntry, ScheduleInfo, ScheduleOptions, SchedulerCommand, SchedulerError,
    SchedulerState,
};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Helper to send a command and wait for its response.
    async fn request<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Submit a job of `job_type` at every occurrence of `schedule`.
    pub async fn schedule(
        &self,
        job_type: impl Into<JobType>,
        payload: Value,
        schedule: Schedule,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, SchedulerError> {
        let entry = ScheduleEntry::new(job_type.into(), payload, schedule, options, Utc::now())?;
        self.request(
            |response| SchedulerCommand::Register {
                entry: Box::new(entry),
                response,
            },
            "register",
        )
        .await
    }

    /// Submit a job every `interval`, starting one interval from now.
    pub async fn schedule_periodic(
        &self,
        job_type: impl Into<JobType>,
        payload: Value,
        interval: Duration,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, SchedulerError> {
        let schedule = Schedule::every(interval)?;
        self.schedule(job_type, payload, schedule, options).await
    }

    /// Submit a job at every match of a cron expression (UTC).
    pub async fn schedule_cron(
        &self,
        job_type: impl Into<JobType>,
        payload: Value,
        expression: &str,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, SchedulerError> {
        let schedule = Schedule::new(expression)?;
        self.schedule(job_type, payload, schedule, options).await
    }

    /// Remove a schedule. Jobs it already submitted are unaffected.
    pub async fn cancel(&self, id: ScheduleId) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerCommand::Cancel { id, response }, "cancel")
            .await?
    }

    /// Registered schedules, soonest firing first.
    pub async fn list(&self) -> Result<Vec<ScheduleInfo>, SchedulerError> {
        self.request(|response| SchedulerCommand::List { response }, "list")
            .await
    }

    /// Pause the scheduler.
    ///
    /// While paused no schedule fires. Occurrences that pass during the
    /// pause are skipped on resume.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shutdown the scheduler.
    ///
    /// Stops future firings; jobs already submitted keep running.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }
}
