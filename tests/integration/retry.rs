//! Retry and backoff integration tests.

use hopper::testing::FailingHandler;
use hopper::{
    Engine, HandlerError, HandlerOptions, JobContext, JobState, RetryCondition, RetryPolicy,
    SubmitOptions,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::{EventRecorder, fast_engine, wait_for_state};

#[tokio::test]
async fn test_fails_twice_then_succeeds() {
    let engine = fast_engine(2);
    let recorder = EventRecorder::new();
    engine.events().register(recorder.clone()).await;
    let handler = Arc::new(FailingHandler::new(2));
    engine.register("flaky", handler.clone()).unwrap();
    engine.start().unwrap();

    let id = engine
        .submit(
            "flaky",
            Value::Null,
            SubmitOptions::default().with_max_attempts(3),
        )
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempt, 3);
    assert_eq!(handler.call_count().await, 3);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(recorder.count("job_started").await, 3);
    assert_eq!(recorder.count("job_retrying").await, 2);
    assert_eq!(recorder.count("job_completed").await, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_always_failing_job_exhausts_attempts() {
    let engine = fast_engine(1);
    let handler = Arc::new(FailingHandler::with_error(u32::MAX, "disk full"));
    engine.register("doomed", handler.clone()).unwrap();
    engine.start().unwrap();

    let id = engine
        .submit(
            "doomed",
            Value::Null,
            SubmitOptions::default().with_max_attempts(2),
        )
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 2);
    assert!(
        status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("disk full"))
    );
    assert_eq!(handler.call_count().await, 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let engine = fast_engine(1);
    let handler = Arc::new(FailingHandler::always().permanent());
    engine.register("invalid", handler.clone()).unwrap();
    engine.start().unwrap();

    let id = engine
        .submit(
            "invalid",
            Value::Null,
            SubmitOptions::default().with_max_attempts(5),
        )
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 1);
    assert_eq!(handler.call_count().await, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_is_retried() {
    let engine = fast_engine(1);
    engine
        .register_fn("fragile", |ctx: JobContext| async move {
            if ctx.attempt == 1 {
                panic!("first attempt explodes");
            }
            Ok(())
        })
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .submit("fragile", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempt, 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backoff_spaces_attempts() {
    let engine = Engine::builder()
        .with_workers(1)
        .with_retry_policy(RetryPolicy::exponential(
            Duration::from_millis(40),
            Duration::from_secs(1),
        ))
        .build()
        .unwrap();

    let starts: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let recorded = Arc::clone(&starts);
    engine
        .register_fn("spaced", move |_ctx: JobContext| {
            let recorded = Arc::clone(&recorded);
            async move {
                recorded.lock().unwrap().push(Instant::now());
                Err::<(), _>(HandlerError::failed("again"))
            }
        })
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .submit(
            "spaced",
            Value::Null,
            SubmitOptions::default().with_max_attempts(3),
        )
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.state, JobState::Failed);

    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 3);
    // 40ms before the second attempt, 80ms before the third
    assert!(starts[1] - starts[0] >= Duration::from_millis(40));
    assert!(starts[2] - starts[1] >= Duration::from_millis(80));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_per_type_policy_overrides_engine_default() {
    let engine = fast_engine(1);
    let handler = Arc::new(FailingHandler::with_error(u32::MAX, "no"));
    engine
        .register_with(
            "once",
            handler.clone(),
            HandlerOptions::new().with_retry_policy(
                RetryPolicy::fixed(Duration::from_millis(5))
                    .with_condition(RetryCondition::Never),
            ),
        )
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .submit(
            "once",
            Value::Null,
            SubmitOptions::default().with_max_attempts(4),
        )
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 1);
    assert_eq!(handler.call_count().await, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_serves_other_jobs_during_backoff() {
    let engine = fast_engine(1);
    engine
        .register_with(
            "backoff",
            Arc::new(FailingHandler::new(1)),
            HandlerOptions::new()
                .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(800))),
        )
        .unwrap();
    engine
        .register_fn("quick", |_ctx: JobContext| async {
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    engine.start().unwrap();

    let a = engine
        .submit("backoff", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    wait_for_state(&engine, a, JobState::RetryWait, Duration::from_secs(2)).await;

    let b = engine
        .submit("quick", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    let status = engine.wait_for(b, Duration::from_millis(500)).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(
        engine.status(a).await.unwrap().unwrap().state,
        JobState::RetryWait
    );

    let status = engine.wait_for(a, Duration::from_secs(3)).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempt, 2);

    engine.shutdown().await.unwrap();
}
