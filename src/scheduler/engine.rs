//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Submitting jobs at the occurrences of their schedules
//! - Coalescing missed occurrences into a single firing
//! - Skipping firings that would overlap an unfinished job, when asked to
//! - Pause and resume functionality
//! - Event emission

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::schedule::Schedule;
use crate::core::types::{JobType, ScheduleId};
use crate::events::{Event, EventBus};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{
    JobSubmitter, ScheduleEntry, ScheduleOptions, SchedulerCommand, SchedulerError,
    SchedulerState,
};

/// Default tick interval.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Main scheduler submitting recurring jobs.
pub struct Scheduler<S: JobSubmitter> {
    /// Registered schedules.
    entries: HashMap<ScheduleId, ScheduleEntry>,
    /// Where fired jobs go.
    submitter: Arc<S>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Tick interval for checking schedules.
    tick_interval: Duration,
}

impl<S: JobSubmitter + 'static> Scheduler<S> {
    /// Create a new scheduler submitting through `submitter`.
    pub fn new(submitter: Arc<S>) -> Self {
        Self {
            entries: HashMap::new(),
            submitter,
            event_bus: Arc::new(EventBus::new()),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Register a schedule before the scheduler starts.
    pub fn add(
        &mut self,
        job_type: impl Into<JobType>,
        payload: Value,
        schedule: Schedule,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, SchedulerError> {
        let entry = ScheduleEntry::new(job_type.into(), payload, schedule, options, Utc::now())?;
        let id = entry.id;
        self.insert(entry);
        Ok(id)
    }

    /// Number of registered schedules.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start the scheduler and return a handle for controlling it.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    fn insert(&mut self, entry: ScheduleEntry) {
        tracing::info!(
            schedule_id = %entry.id,
            job_type = %entry.job_type,
            expression = entry.schedule.expression(),
            next_fire = %entry.next_fire,
            "Registered schedule"
        );
        self.entries.insert(entry.id, entry);
    }

    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let current_state = *state.read().await;
                    if current_state == SchedulerState::Running {
                        self.fire_due(Utc::now()).await;
                    }
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("All scheduler handles dropped, stopping");
                        break;
                    };
                    match command {
                        SchedulerCommand::Register { entry, response } => {
                            let id = entry.id;
                            self.insert(*entry);
                            let _ = response.send(id);
                        }
                        SchedulerCommand::Cancel { id, response } => {
                            let result = match self.entries.remove(&id) {
                                Some(entry) => {
                                    tracing::info!(schedule_id = %id, job_type = %entry.job_type, "Cancelled schedule");
                                    Ok(())
                                }
                                None => Err(SchedulerError::ScheduleNotFound(id)),
                            };
                            let _ = response.send(result);
                        }
                        SchedulerCommand::List { response } => {
                            let mut infos: Vec<_> = self.entries.values().map(ScheduleEntry::info).collect();
                            infos.sort_by_key(|info| info.next_fire);
                            let _ = response.send(infos);
                        }
                        SchedulerCommand::Pause { response } => {
                            *state.write().await = SchedulerState::Paused;
                            tracing::info!("Scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            *state.write().await = SchedulerState::Running;
                            self.skip_missed(Utc::now());
                            tracing::info!("Scheduler resumed, skipping any schedules that fired during pause");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Stopped;
                            tracing::info!(schedules = self.entries.len(), "Scheduler stopped");
                            let _ = response.send(());
                            return;
                        }
                    }
                }
            }
        }

        *state.write().await = SchedulerState::Stopped;
    }

    /// Submit one job for every schedule that is due at `now`.
    ///
    /// Several occurrences missed since the last tick result in a single
    /// submission.
    async fn fire_due(&mut self, now: DateTime<Utc>) {
        let submitter = &self.submitter;
        let event_bus = &self.event_bus;
        let mut exhausted = Vec::new();

        for entry in self.entries.values_mut() {
            if !entry.is_due(now) {
                continue;
            }

            match entry.advance(now) {
                Ok(passed) if passed > 1 => {
                    tracing::warn!(
                        schedule_id = %entry.id,
                        job_type = %entry.job_type,
                        missed_occurrences = passed,
                        "Multiple scheduled occurrences missed, firing once"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(schedule_id = %entry.id, error = %e, "Schedule has no further occurrences, removing it");
                    exhausted.push(entry.id);
                }
            }

            if !entry.options.allow_overlap {
                if let Some(previous) = entry.last_job {
                    if submitter.is_active(&previous).await {
                        tracing::debug!(
                            schedule_id = %entry.id,
                            previous_job = %previous,
                            "Skipping firing, previous job still in flight"
                        );
                        continue;
                    }
                }
            }

            match submitter.submit_scheduled(entry.to_job()).await {
                Ok(job_id) => {
                    entry.fired += 1;
                    entry.last_job = Some(job_id);
                    event_bus
                        .emit(Event::schedule_fired(entry.id, job_id, entry.job_type.clone()))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(schedule_id = %entry.id, job_type = %entry.job_type, error = %e, "Failed to submit scheduled job");
                }
            }
        }

        for id in exhausted {
            self.entries.remove(&id);
        }
    }

    /// Push every overdue schedule past `now` without firing it.
    fn skip_missed(&mut self, now: DateTime<Utc>) {
        let mut exhausted = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.is_due(now) && entry.advance(now).is_err() {
                exhausted.push(entry.id);
            }
        }
        for id in exhausted {
            self.entries.remove(&id);
        }
    }
}
