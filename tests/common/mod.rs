//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hopper::{Engine, Event, EventHandler, JobId, JobState, JobStatus, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// An engine with fast retries and scheduler ticks, not yet started.
pub fn fast_engine(workers: usize) -> Engine {
    Engine::builder()
        .with_workers(workers)
        .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(10)))
        .with_tick_interval(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Wait for a job to reach an expected state, polling the engine.
///
/// More reliable than fixed sleeps since execution time can vary.
///
/// # Panics
///
/// Panics if the timeout is reached before the job reaches the expected state.
pub async fn wait_for_state(
    engine: &Engine,
    id: JobId,
    expected: JobState,
    timeout: Duration,
) -> JobStatus {
    let start = tokio::time::Instant::now();
    loop {
        let status = engine.status(id).await.unwrap().unwrap();
        if status.state == expected {
            return status;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for job {} to reach {:?}, current state: {:?}",
                id, expected, status.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Event handler that records every event it sees.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Event kinds recorded for one job, in emission order.
    pub async fn kinds_for(&self, id: JobId) -> Vec<&'static str> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.job_id() == id)
            .map(Event::kind)
            .collect()
    }

    pub async fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}
