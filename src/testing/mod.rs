//! Testing utilities for users of the hopper library.
//!
//! This module provides helpers for testing job handlers and engines:
//!
//! - [`FailingHandler`]: A handler that fails N times then succeeds
//! - [`RecordingHandler`]: Captures every context it is called with
//! - [`SlowHandler`]: Sleeps before succeeding, for timeout and shutdown tests
//! - [`TestHarness`]: Runs jobs through a started engine with fast timings

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::handler::{HandlerError, JobContext, JobHandler};
use crate::core::job::JobStatus;
use crate::core::retry::RetryPolicy;
use crate::engine::{Engine, EngineError, SubmitOptions};

/// A handler that fails a configurable number of times before succeeding.
///
/// Useful for testing retry logic and error handling.
///
/// The failure count is protected by a mutex, so concurrent attempts see a
/// deterministic sequence.
///
/// # Example
///
/// ```
/// use hopper::testing::FailingHandler;
///
/// // Fails 2 times, then succeeds on the 3rd attempt
/// let handler = FailingHandler::new(2);
/// ```
pub struct FailingHandler {
    state: Mutex<FailingHandlerState>,
    total_failures: u32,
    error_message: String,
    permanent: bool,
}

struct FailingHandlerState {
    failures_remaining: u32,
    call_count: u32,
}

impl FailingHandler {
    /// Create a handler that fails `fail_count` times then succeeds.
    pub fn new(fail_count: u32) -> Self {
        Self::with_error(fail_count, "intentional test failure")
    }

    /// Create a handler that fails with a custom error message.
    pub fn with_error(fail_count: u32, message: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(FailingHandlerState {
                failures_remaining: fail_count,
                call_count: 0,
            }),
            total_failures: fail_count,
            error_message: message.into(),
            permanent: false,
        }
    }

    /// Create a handler that never succeeds.
    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    /// Report failures as permanent so they are never retried.
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Get the number of failures remaining before success.
    pub async fn failures_remaining(&self) -> u32 {
        self.state.lock().await.failures_remaining
    }

    /// Get the number of times this handler has been called.
    pub async fn call_count(&self) -> u32 {
        self.state.lock().await.call_count
    }

    /// Reset the failure counter for reuse.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.failures_remaining = self.total_failures;
        state.call_count = 0;
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if state.failures_remaining == 0 {
            return Ok(());
        }
        if state.failures_remaining != u32::MAX {
            state.failures_remaining -= 1;
        }
        if self.permanent {
            Err(HandlerError::permanent(self.error_message.clone()))
        } else {
            Err(HandlerError::failed(self.error_message.clone()))
        }
    }
}

/// A handler that records every context it is called with.
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<JobContext>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts of every call, in call order.
    pub async fn calls(&self) -> Vec<JobContext> {
        self.calls.lock().await.clone()
    }

    /// Payloads of every call, in call order.
    pub async fn payloads(&self) -> Vec<Value> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|ctx| ctx.payload.clone())
            .collect()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        self.calls.lock().await.push(ctx.clone());
        Ok(())
    }
}

/// A handler that sleeps before succeeding.
pub struct SlowHandler {
    duration: Duration,
}

impl SlowHandler {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Runs jobs through a started engine with short timings.
///
/// Retries use a fixed 10ms backoff and the scheduler ticks every 10ms.
///
/// # Example
///
/// ```ignore
/// use hopper::testing::{FailingHandler, TestHarness};
/// use std::sync::Arc;
///
/// let harness = TestHarness::new();
/// harness.register("flaky", Arc::new(FailingHandler::new(2)));
/// let status = harness.run("flaky", serde_json::Value::Null).await?;
/// assert_eq!(status.attempt, 3);
/// ```
pub struct TestHarness {
    engine: Engine,
    timeout: Duration,
}

impl TestHarness {
    /// Create and start a harness with two workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_workers(2)
    }

    /// Create and start a harness with `workers` workers.
    pub fn with_workers(workers: usize) -> Self {
        let engine = Engine::builder()
            .with_workers(workers.max(1))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(10)))
            .with_tick_interval(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(5))
            .build()
            .expect("harness settings are valid");
        engine.start().expect("fresh engine starts");
        Self {
            engine,
            timeout: Duration::from_secs(5),
        }
    }

    /// How long `run` waits for a job to finish.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The engine under test.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Register a handler; panics on an empty job type.
    pub fn register(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.engine
            .register(job_type, handler)
            .expect("job type is not empty");
    }

    /// Submit a job and wait until it completes or fails.
    pub async fn run(&self, job_type: &str, payload: Value) -> Result<JobStatus, EngineError> {
        self.run_with(job_type, payload, SubmitOptions::default())
            .await
    }

    /// Submit a job with options and wait until it completes or fails.
    pub async fn run_with(
        &self,
        job_type: &str,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<JobStatus, EngineError> {
        let id = self.engine.submit(job_type, payload, options).await?;
        self.engine.wait_for(id, self.timeout).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
