//! Graceful shutdown integration tests.
//!
//! Tests that verify the engine waits for running jobs to finish, leaves
//! queued jobs untouched and reports what was left behind.

use hopper::testing::SlowHandler;
use hopper::{
    Engine, EngineError, HandlerError, JobContext, JobState, RetryPolicy, SubmitOptions,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{fast_engine, wait_for_state};

#[tokio::test]
async fn test_shutdown_waits_for_running_jobs() {
    let engine = fast_engine(3);
    engine
        .register("slow", Arc::new(SlowHandler::new(Duration::from_millis(200))))
        .unwrap();
    engine.start().unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            engine
                .submit("slow", json!(n), SubmitOptions::default())
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        wait_for_state(&engine, *id, JobState::Running, Duration::from_secs(2)).await;
    }

    let report = engine.shutdown().await.unwrap();
    assert!(report.workers_stopped);
    assert!(report.is_clean());
    assert_eq!(report.counts.get(JobState::Completed), 3);

    for id in ids {
        let status = engine.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
    }
}

#[tokio::test]
async fn test_shutdown_leaves_queued_jobs_ready() {
    let engine = fast_engine(1);
    engine
        .register("slow", Arc::new(SlowHandler::new(Duration::from_millis(150))))
        .unwrap();
    engine.start().unwrap();

    let first = engine
        .submit("slow", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    wait_for_state(&engine, first, JobState::Running, Duration::from_secs(2)).await;

    let mut queued = Vec::new();
    for _ in 0..2 {
        queued.push(
            engine
                .submit("slow", Value::Null, SubmitOptions::default())
                .await
                .unwrap(),
        );
    }

    let report = engine.shutdown().await.unwrap();
    assert!(report.workers_stopped);
    assert_eq!(
        engine.status(first).await.unwrap().unwrap().state,
        JobState::Completed
    );

    let mut ready = report.ready.clone();
    ready.sort();
    queued.sort();
    assert_eq!(ready, queued);
}

#[tokio::test]
async fn test_shutdown_timeout_reports_running_jobs() {
    let engine = Engine::builder()
        .with_workers(1)
        .with_shutdown_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    engine
        .register("stuck", Arc::new(SlowHandler::new(Duration::from_secs(5))))
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .submit("stuck", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    wait_for_state(&engine, id, JobState::Running, Duration::from_secs(2)).await;

    let report = engine.shutdown().await.unwrap();
    assert!(!report.workers_stopped);
    assert_eq!(report.running, vec![id]);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn test_shutdown_keeps_retry_waiting_jobs_delayed() {
    let engine = Engine::builder()
        .with_workers(1)
        .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(60)))
        .build()
        .unwrap();
    engine
        .register_fn("flaky", |_ctx: JobContext| async {
            Err::<(), _>(HandlerError::failed("try later"))
        })
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .submit("flaky", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    let status = wait_for_state(&engine, id, JobState::RetryWait, Duration::from_secs(2)).await;
    assert_eq!(status.attempt, 1);
    assert_eq!(status.last_error.as_deref(), Some("execution failed: try later"));

    let report = engine.shutdown().await.unwrap();
    assert_eq!(report.delayed, vec![id]);
    assert_eq!(
        engine.status(id).await.unwrap().unwrap().state,
        JobState::RetryWait
    );
}

#[tokio::test]
async fn test_failures_during_drain_are_terminal() {
    let engine = Engine::builder()
        .with_workers(3)
        .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(10)))
        .with_shutdown_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    engine
        .register_fn("late", |_ctx: JobContext| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err::<(), _>(HandlerError::failed("upstream gone"))
        })
        .unwrap();
    engine.start().unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            engine
                .submit(
                    "late",
                    json!(n),
                    SubmitOptions::default().with_max_attempts(3),
                )
                .await
                .unwrap(),
        );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = engine.shutdown().await.unwrap();
    assert!(report.workers_stopped);
    assert!(report.delayed.is_empty());
    assert!(report.running.is_empty());
    assert_eq!(report.counts.get(JobState::Failed), 3);

    for id in ids {
        let status = engine.status(id).await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempt, 1);
        assert!(
            status
                .last_error
                .as_deref()
                .unwrap()
                .starts_with("engine shut down before retry")
        );
    }
}

#[tokio::test]
async fn test_submit_rejected_after_shutdown() {
    let engine = fast_engine(1);
    engine.start().unwrap();
    engine.shutdown().await.unwrap();

    let result = engine
        .submit("anything", Value::Null, SubmitOptions::default())
        .await;
    assert!(matches!(result, Err(EngineError::ShuttingDown)));
    assert!(!engine.is_running());
}
