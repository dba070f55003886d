//! Job lifecycle integration tests.
//!
//! Tests that verify submission, dispatch and status reporting through the
//! public engine API.

use async_trait::async_trait;
use hopper::testing::{RecordingHandler, SlowHandler};
use hopper::{
    EngineError, Event, EventHandler, HandlerError, HandlerOptions, JobContext, JobFilter,
    JobState, SubmitOptions,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::common::{EventRecorder, fast_engine, wait_for_state};

#[tokio::test]
async fn test_job_runs_to_completion_with_events_in_order() {
    let engine = fast_engine(2);
    let recorder = EventRecorder::new();
    engine.events().register(recorder.clone()).await;
    engine
        .register_fn("greet", |_ctx: JobContext| async { Ok(()) })
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .submit("greet", json!({"name": "ada"}), SubmitOptions::default())
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempt, 1);
    assert!(status.last_error.is_none());
    assert!(status.started_at.is_some());
    assert!(status.finished_at >= status.started_at);

    // The completed event may be emitted just after the tracker update
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        recorder.kinds_for(id).await,
        vec!["job_submitted", "job_started", "job_completed"]
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_receives_typed_payload() {
    #[derive(Deserialize)]
    struct Resize {
        width: u32,
        height: u32,
    }

    let engine = fast_engine(1);
    let area = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&area);
    engine
        .register_fn("resize", move |ctx: JobContext| {
            let seen = Arc::clone(&seen);
            async move {
                let resize: Resize = ctx.payload_as()?;
                seen.store((resize.width * resize.height) as usize, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .submit(
            "resize",
            json!({"width": 40, "height": 30}),
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    engine.wait_for(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(area.load(Ordering::SeqCst), 1200);

    // A payload of the wrong shape is a permanent failure
    let id = engine
        .submit("resize", json!("not an object"), SubmitOptions::default())
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_job_type_fails_without_running() {
    let engine = fast_engine(1);
    let recorder = EventRecorder::new();
    engine.events().register(recorder.clone()).await;
    engine.start().unwrap();

    let id = engine
        .submit("nobody_handles_this", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 0);
    assert!(
        status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("nobody_handles_this"))
    );
    assert_eq!(
        recorder.kinds_for(id).await,
        vec!["job_submitted", "job_failed"]
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_max_attempts_rejected() {
    let engine = fast_engine(1);
    let result = engine
        .submit(
            "anything",
            Value::Null,
            SubmitOptions::default().with_max_attempts(0),
        )
        .await;
    assert!(matches!(result, Err(EngineError::InvalidMaxAttempts)));
    assert_eq!(engine.stats().await.unwrap().counts.total(), 0);
}

#[tokio::test]
async fn test_delayed_submission_waits_before_running() {
    let engine = fast_engine(1);
    let handler = Arc::new(RecordingHandler::new());
    engine.register("later", handler.clone()).unwrap();
    engine.start().unwrap();

    let id = engine
        .submit(
            "later",
            Value::Null,
            SubmitOptions::default().with_delay(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    let status = engine.status(id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::RetryWait);
    assert!(status.next_run_at.is_some());
    assert_eq!(status.attempt, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.call_count().await, 0);

    let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(handler.call_count().await, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_workers_bound_concurrency() {
    let engine = fast_engine(3);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    engine
        .register_fn("busy", move |_ctx: JobContext| {
            let active = Arc::clone(&a);
            let peak = Arc::clone(&p);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    engine.start().unwrap();

    let mut ids = Vec::new();
    for n in 0..12 {
        ids.push(
            engine
                .submit("busy", json!(n), SubmitOptions::default())
                .await
                .unwrap(),
        );
    }
    for id in ids {
        let status = engine.wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeds worker count", peak);
    assert!(peak >= 2, "expected parallel execution, peak was {}", peak);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_each_job_runs_exactly_once() {
    let engine = fast_engine(4);
    let handler = Arc::new(RecordingHandler::new());
    engine.register("count", handler.clone()).unwrap();
    engine.start().unwrap();

    let mut ids = Vec::new();
    for n in 0..50 {
        ids.push(
            engine
                .submit("count", json!(n), SubmitOptions::default())
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        engine.wait_for(*id, Duration::from_secs(5)).await.unwrap();
    }

    let mut payloads: Vec<i64> = handler
        .payloads()
        .await
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    payloads.sort_unstable();
    assert_eq!(payloads, (0..50).collect::<Vec<_>>());

    let mut contexts = handler.calls().await;
    contexts.sort_by_key(|ctx| ctx.job_id);
    contexts.dedup_by_key(|ctx| ctx.job_id);
    assert_eq!(contexts.len(), 50);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_timeout_fails_attempt() {
    let engine = fast_engine(1);
    engine
        .register_with(
            "stuck",
            Arc::new(SlowHandler::new(Duration::from_secs(10))),
            HandlerOptions::new()
                .with_timeout(Duration::from_millis(30))
                .with_max_attempts(1),
        )
        .unwrap();
    engine.start().unwrap();

    let id = engine
        .submit("stuck", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    let status = wait_for_state(&engine, id, JobState::Failed, Duration::from_secs(5)).await;
    assert_eq!(status.attempt, 1);
    assert!(
        status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("timed out"))
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_list_filters_and_prune() {
    let engine = fast_engine(2);
    engine
        .register_fn("ok", |_ctx: JobContext| async { Ok(()) })
        .unwrap();
    engine.start().unwrap();

    let ok = engine
        .submit("ok", Value::Null, SubmitOptions::default().with_correlation_id("batch"))
        .await
        .unwrap();
    let missing = engine
        .submit("missing", Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    engine.wait_for(ok, Duration::from_secs(5)).await.unwrap();
    engine.wait_for(missing, Duration::from_secs(5)).await.unwrap();

    let batch = engine
        .list(&JobFilter::all().with_correlation_id("batch"))
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, ok);

    let failed = engine
        .list(&JobFilter::all().with_state(JobState::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, missing);

    let removed = engine
        .prune(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(engine.status(ok).await.unwrap().is_none());

    engine.shutdown().await.unwrap();
}

struct PanicOnStart;

#[async_trait]
impl EventHandler for PanicOnStart {
    async fn handle(&self, event: &Event) {
        if let Event::JobStarted { .. } = event {
            panic!("listener exploded");
        }
    }
}

#[tokio::test]
async fn test_panicking_event_handler_does_not_stall_worker() {
    let engine = fast_engine(1);
    engine.events().register(Arc::new(PanicOnStart)).await;
    let recorder = EventRecorder::new();
    engine.events().register(recorder.clone()).await;
    let handler = Arc::new(RecordingHandler::new());
    engine.register("work", handler.clone()).unwrap();
    engine.start().unwrap();

    let a = engine
        .submit("work", json!("a"), SubmitOptions::default())
        .await
        .unwrap();
    let status = engine.wait_for(a, Duration::from_secs(2)).await.unwrap();
    assert_eq!(status.state, JobState::Completed);

    let b = engine
        .submit("work", json!("b"), SubmitOptions::default())
        .await
        .unwrap();
    let status = engine.wait_for(b, Duration::from_secs(2)).await.unwrap();
    assert_eq!(status.state, JobState::Completed);

    assert_eq!(handler.payloads().await, vec![json!("a"), json!("b")]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count("job_completed").await, 2);
    assert_eq!(engine.stats().await.unwrap().busy_workers, 0);

    engine.shutdown().await.unwrap();
}
