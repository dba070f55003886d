//! Recurring job integration tests.
//!
//! Tests that verify the scheduler submits jobs through the engine at each
//! occurrence of a schedule.

use hopper::testing::{RecordingHandler, SlowHandler};
use hopper::{JobFilter, JobId, JobState, Schedule, ScheduleOptions};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{EventRecorder, fast_engine};

#[tokio::test]
async fn test_periodic_schedule_submits_distinct_jobs() {
    let engine = fast_engine(2);
    let recorder = EventRecorder::new();
    engine.events().register(recorder.clone()).await;
    let handler = Arc::new(RecordingHandler::new());
    engine.register("heartbeat", handler.clone()).unwrap();
    engine.start().unwrap();

    let schedule_id = engine
        .schedule_periodic(
            "heartbeat",
            json!({"source": "timer"}),
            Duration::from_millis(50),
            ScheduleOptions::default().with_correlation_id("beats"),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.cancel_schedule(schedule_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let jobs = engine
        .list(&JobFilter::all().with_correlation_id("beats"))
        .await
        .unwrap();
    assert!(jobs.len() >= 3, "expected at least 3 firings, got {}", jobs.len());

    let ids: HashSet<JobId> = jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids.len(), jobs.len());

    for status in &jobs {
        let job = engine.job(status.id).await.unwrap().unwrap();
        assert_eq!(job.schedule_id(), Some(schedule_id));
        assert_eq!(job.payload(), &json!({"source": "timer"}));
    }
    assert_eq!(recorder.count("schedule_fired").await, jobs.len());

    engine.shutdown().await.unwrap();
    assert!(handler.call_count().await >= 3);
}

#[tokio::test]
async fn test_cancelled_schedule_stops_firing() {
    let engine = fast_engine(1);
    let handler = Arc::new(RecordingHandler::new());
    engine.register("tick", handler.clone()).unwrap();
    engine.start().unwrap();

    let id = engine
        .schedule_periodic(
            "tick",
            json!(null),
            Duration::from_millis(30),
            ScheduleOptions::default(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.cancel_schedule(id).await.unwrap();
    assert!(engine.schedules().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let fired = engine
        .list(&JobFilter::all().with_job_type("tick"))
        .await
        .unwrap()
        .len();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let later = engine
        .list(&JobFilter::all().with_job_type("tick"))
        .await
        .unwrap()
        .len();
    assert_eq!(fired, later);

    // Cancelling twice reports the schedule as unknown
    assert!(engine.cancel_schedule(id).await.is_err());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_overlap_guard_skips_while_previous_job_runs() {
    let engine = fast_engine(2);
    engine
        .register("report", Arc::new(SlowHandler::new(Duration::from_millis(400))))
        .unwrap();
    engine.start().unwrap();

    engine
        .schedule_periodic(
            "report",
            json!(null),
            Duration::from_millis(30),
            ScheduleOptions::default().with_allow_overlap(false),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let jobs = engine
        .list(&JobFilter::all().with_job_type("report"))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Running);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_schedule_listing() {
    let engine = fast_engine(1);
    engine.start().unwrap();

    let cron = engine
        .schedule_cron("nightly", json!(null), "0 0 3 * * *", ScheduleOptions::default())
        .await
        .unwrap();
    let every = engine
        .schedule_periodic(
            "poll",
            json!(null),
            Duration::from_secs(60),
            ScheduleOptions::default().with_max_attempts(1),
        )
        .await
        .unwrap();

    let schedules = engine.schedules().await.unwrap();
    assert_eq!(schedules.len(), 2);

    let nightly = schedules.iter().find(|s| s.id == cron).unwrap();
    assert_eq!(nightly.expression, "0 0 3 * * *");
    assert_eq!(nightly.fired, 0);
    assert!(nightly.next_fire > chrono::Utc::now());

    let poll = schedules.iter().find(|s| s.id == every).unwrap();
    assert_eq!(poll.options.max_attempts, Some(1));

    let invalid = engine
        .schedule_cron("broken", json!(null), "not a cron", ScheduleOptions::default())
        .await;
    assert!(invalid.is_err());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sub_second_every_expression_fires() {
    let engine = fast_engine(1);
    let handler = Arc::new(RecordingHandler::new());
    engine.register("tick", handler.clone()).unwrap();
    engine.start().unwrap();

    let schedule = Schedule::new("@every 100ms").unwrap();
    let schedule_id = engine
        .schedule(
            "tick",
            json!(null),
            schedule,
            ScheduleOptions::default().with_correlation_id("ticks"),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(450)).await;
    engine.cancel_schedule(schedule_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let jobs = engine
        .list(&JobFilter::all().with_correlation_id("ticks"))
        .await
        .unwrap();
    assert!(
        (2..=6).contains(&jobs.len()),
        "expected 2 to 6 firings, got {}",
        jobs.len()
    );

    engine.shutdown().await.unwrap();
    assert_eq!(handler.call_count().await, jobs.len());
}
