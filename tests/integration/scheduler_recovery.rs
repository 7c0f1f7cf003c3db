use crate::helpers::{drain, memory_scheduler, record_events, utc};
use cadence::config::SchedulerConfig;
use cadence::scheduler::{
    EventContext, EventKind, JsonTimestampStore, MemoryTaskStore, Scheduler, TaskStore,
    TimestampStore,
};
use cadence::{Frequency, Task};
use std::sync::Arc;

const LAST_RUN: &str = "scheduler.last_run";

#[tokio::test]
async fn first_ever_run_records_now_and_changes_nothing() {
    let now = utc("2025-06-10T08:00:00Z");
    let task = Task::new("a", "a", utc("2025-06-01T08:00:00Z"), Frequency::daily(1));
    let (scheduler, store, timestamps) = memory_scheduler(vec![task.clone()]);
    let events = record_events(&scheduler);

    let report = scheduler.recover_missed_tasks_at(now).await.expect("recover");
    assert!(report.first_run);
    assert!(drain(&events).is_empty());
    assert_eq!(timestamps.load(LAST_RUN).await.unwrap(), Some(now));
    assert_eq!(store.get_task("a").await.unwrap().unwrap(), task);
}

#[tokio::test]
async fn missed_weekly_occurrences_are_announced_with_exact_keys() {
    // Mondays and Thursdays; the process was down from Sunday to the next Sunday.
    let (scheduler, store, timestamps) = memory_scheduler(vec![Task::new(
        "gym",
        "Gym",
        utc("2025-06-02T18:00:00Z"),
        Frequency::weekly(1, [1, 4]),
    )]);
    timestamps
        .save(LAST_RUN, utc("2025-06-01T00:00:00Z"))
        .await
        .unwrap();
    let events = record_events(&scheduler);

    let now = utc("2025-06-08T12:00:00Z");
    let report = scheduler.recover_missed_tasks_at(now).await.expect("recover");
    assert_eq!(report.overdue, 2);

    let events = drain(&events);
    let due_ats: Vec<_> = events.iter().map(|e| e.due_at).collect();
    assert_eq!(
        due_ats,
        vec![utc("2025-06-02T18:00:00Z"), utc("2025-06-05T18:00:00Z")]
    );
    assert!(
        events
            .iter()
            .all(|e| e.kind == EventKind::Overdue && e.context == EventContext::Overdue)
    );

    let task = store.get_task("gym").await.unwrap().unwrap();
    assert_eq!(task.due_at, utc("2025-06-09T18:00:00Z"));
}

#[tokio::test]
async fn completed_occurrences_are_not_reported_missed() {
    let mut task = Task::new("a", "a", utc("2025-06-01T08:00:00Z"), Frequency::daily(1));
    task.last_completed_at = Some(utc("2025-06-02T09:00:00Z"));
    let (scheduler, _, timestamps) = memory_scheduler(vec![task]);
    timestamps
        .save(LAST_RUN, utc("2025-05-31T00:00:00Z"))
        .await
        .unwrap();

    let report = scheduler
        .recover_missed_tasks_at(utc("2025-06-03T12:00:00Z"))
        .await
        .expect("recover");
    // Jun 1 and Jun 2 were completed; only Jun 3 is missed.
    assert_eq!(report.overdue, 1);
}

#[tokio::test]
async fn advancing_is_bounded_by_the_configured_cap() {
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new(
        "ancient",
        "ancient",
        utc("1990-01-01T08:00:00Z"),
        Frequency::daily(1),
    )]));
    let timestamps = Arc::new(cadence::scheduler::MemoryTimestampStore::new());
    timestamps
        .save(LAST_RUN, utc("2025-06-01T00:00:00Z"))
        .await
        .unwrap();
    let scheduler = Scheduler::builder(store.clone(), timestamps)
        .with_config(SchedulerConfig {
            max_recovery_advances: 10,
            ..SchedulerConfig::default()
        })
        .build()
        .expect("build");

    let now = utc("2025-06-02T00:00:00Z");
    let report = scheduler.recover_missed_tasks_at(now).await.expect("recover");
    assert_eq!(report.failed, 0);
    let task = store.get_task("ancient").await.unwrap().unwrap();
    assert_eq!(task.due_at, utc("1990-01-11T08:00:00Z"));
    assert!(task.due_at < now);
}

#[tokio::test]
async fn advancing_far_past_due_date_reaches_now() {
    let (scheduler, store, timestamps) = memory_scheduler(vec![Task::new(
        "monthly",
        "monthly",
        utc("2020-01-31T08:00:00Z"),
        Frequency::monthly(1, Some(31)),
    )]);
    timestamps
        .save(LAST_RUN, utc("2025-06-01T00:00:00Z"))
        .await
        .unwrap();

    let now = utc("2025-06-15T00:00:00Z");
    scheduler.recover_missed_tasks_at(now).await.expect("recover");
    let task = store.get_task("monthly").await.unwrap().unwrap();
    assert_eq!(task.due_at, utc("2025-06-30T08:00:00Z"));
}

#[tokio::test]
async fn recovery_is_idempotent_with_a_file_timestamp_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join("timestamps.json");
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new(
        "a",
        "a",
        utc("2025-06-01T08:00:00Z"),
        Frequency::daily(1),
    )]));

    let timestamps = Arc::new(JsonTimestampStore::new(&state));
    timestamps
        .save(LAST_RUN, utc("2025-06-01T00:00:00Z"))
        .await
        .unwrap();
    let scheduler = Scheduler::builder(store.clone(), timestamps)
        .build()
        .expect("build");

    let now = utc("2025-06-02T12:00:00Z");
    let first = scheduler.recover_missed_tasks_at(now).await.expect("recover");
    assert_eq!(first.overdue, 2);
    let second = scheduler.recover_missed_tasks_at(now).await.expect("recover again");
    assert_eq!(second.overdue, 0);

    let reopened = JsonTimestampStore::new(&state);
    assert_eq!(reopened.load(LAST_RUN).await.unwrap(), Some(now));
}

#[tokio::test]
async fn ended_custom_series_disables_task_during_recovery() {
    let (scheduler, store, timestamps) = memory_scheduler(vec![Task::new(
        "trial",
        "Trial reminders",
        utc("2025-06-01T08:00:00Z"),
        Frequency::custom("FREQ=DAILY;COUNT=2"),
    )]);
    timestamps
        .save(LAST_RUN, utc("2025-05-31T00:00:00Z"))
        .await
        .unwrap();

    let report = scheduler
        .recover_missed_tasks_at(utc("2025-06-05T00:00:00Z"))
        .await
        .expect("recover");
    assert_eq!(report.overdue, 2);
    assert!(store.enabled_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn tick_then_recovery_announces_the_occurrence_once() {
    let (scheduler, store, timestamps) = memory_scheduler(vec![Task::new(
        "meds",
        "Meds",
        utc("2025-01-01T09:00:00Z"),
        Frequency::daily(1),
    )]);
    timestamps
        .save(LAST_RUN, utc("2025-01-01T00:00:00Z"))
        .await
        .unwrap();
    let events = record_events(&scheduler);

    let tick = scheduler
        .run_once_at(utc("2025-01-01T10:30:00Z"))
        .await
        .expect("tick");
    assert_eq!(tick.overdue, 1);
    let report = scheduler
        .recover_missed_tasks_at(utc("2025-01-01T10:45:00Z"))
        .await
        .expect("recover");
    assert_eq!(report.overdue, 0);

    let overdue: Vec<_> = drain(&events)
        .into_iter()
        .filter(|e| e.kind == EventKind::Overdue)
        .collect();
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].due_at, utc("2025-01-01T09:00:00Z"));

    let task = store.get_task("meds").await.unwrap().unwrap();
    assert_eq!(task.miss_count, 1);
    assert_eq!(task.due_at, utc("2025-01-02T09:00:00Z"));
}

#[tokio::test]
async fn restart_after_ticks_does_not_repeat_overdue() {
    let (first, store, timestamps) = memory_scheduler(vec![Task::new(
        "water",
        "Water plants",
        utc("2025-01-01T09:00:00Z"),
        Frequency::daily(1),
    )]);
    let first_report = first
        .recover_missed_tasks_at(utc("2025-01-01T08:00:00Z"))
        .await
        .expect("recover");
    assert!(first_report.first_run);
    assert_eq!(
        first
            .run_once_at(utc("2025-01-01T10:30:00Z"))
            .await
            .expect("tick")
            .overdue,
        1
    );
    drop(first);

    // Same stores, no occurrence ledger: only the last-run timestamp survives.
    let restarted = Scheduler::builder(store.clone(), timestamps.clone())
        .build()
        .expect("build scheduler");
    let events = record_events(&restarted);
    let report = restarted
        .recover_missed_tasks_at(utc("2025-01-01T11:00:00Z"))
        .await
        .expect("recover");

    assert_eq!(report.overdue, 0);
    assert!(drain(&events).is_empty());
    let task = store.get_task("water").await.unwrap().unwrap();
    assert_eq!(task.miss_count, 1);
    assert_eq!(task.due_at, utc("2025-01-02T09:00:00Z"));
}
