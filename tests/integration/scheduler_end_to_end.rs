use crate::helpers::{drain, memory_scheduler, record_events, utc};
use cadence::config::SchedulerConfig;
use cadence::scheduler::{
    EventContext, EventKind, MemoryTaskStore, MemoryTimestampStore, OccurrenceLedger, Scheduler,
    TaskStore,
};
use cadence::{CadenceError, Frequency, Task};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn start_emits_due_once_and_run_once_adds_nothing() {
    let task = Task::new(
        "water",
        "Water the plants",
        Utc::now() - chrono::Duration::seconds(1),
        Frequency::daily(1),
    );
    let (scheduler, _, _) = memory_scheduler(vec![task]);
    let events = record_events(&scheduler);

    scheduler.start().await.expect("start");
    let first = drain(&events);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].kind, EventKind::Due);
    assert_eq!(first[0].context, EventContext::Today);
    assert_eq!(first[0].task_id, "water");

    let report = scheduler.run_once().await.expect("run once");
    assert_eq!(report.due, 0);
    assert!(drain(&events).is_empty());

    scheduler.stop();
}

#[tokio::test]
async fn due_and_overdue_fire_on_same_tick_past_grace() {
    let now = utc("2025-05-01T12:00:00Z");
    let grace = SchedulerConfig::default().grace_period();
    let due_at = now - grace - chrono::Duration::seconds(1);
    let (scheduler, _, _) = memory_scheduler(vec![Task::new(
        "rent",
        "Pay rent",
        due_at,
        Frequency::monthly(1, Some(1)),
    )]);
    let events = record_events(&scheduler);

    let report = scheduler.run_once_at(now).await.expect("tick");
    assert_eq!((report.due, report.overdue), (1, 1));

    let events = drain(&events);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Due);
    assert_eq!(events[0].context, EventContext::Today);
    assert_eq!(events[1].kind, EventKind::Overdue);
    assert_eq!(events[1].context, EventContext::Overdue);
    assert_eq!(events[1].due_at, due_at);

    let again = scheduler.run_once_at(now).await.expect("second tick");
    assert_eq!((again.due, again.overdue), (0, 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_from_a_due_listener_survives_the_tick() {
    let due_at = utc("2025-01-01T09:00:00Z");
    let now = utc("2025-01-01T10:30:00Z");
    let (scheduler, store, _) = memory_scheduler(vec![Task::new(
        "stretch",
        "Stretch",
        due_at,
        Frequency::daily(1),
    )]);
    let events = record_events(&scheduler);
    let handle = scheduler.clone();
    scheduler.on(EventKind::Due, move |event| {
        let handle = handle.clone();
        let task_id = event.task_id.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(handle.mark_task_done_at(&task_id, now))
                .map(|_| ())
        })
    });

    let report = scheduler.run_once_at(now).await.expect("tick");
    assert_eq!((report.due, report.overdue), (1, 0));
    assert!(drain(&events).iter().all(|e| e.kind == EventKind::Due));

    let task = store.get_task("stretch").await.unwrap().unwrap();
    assert_eq!(task.completion_count, 1);
    assert_eq!(task.last_completed_at, Some(now));
    assert_eq!(task.due_at, utc("2025-01-02T09:00:00Z"));
    assert_eq!(task.miss_count, 0);
}

#[tokio::test]
async fn repeated_checks_within_the_hour_are_suppressed() {
    let due_at = utc("2025-05-01T09:00:00Z");
    let (scheduler, _, _) = memory_scheduler(vec![Task::new(
        "t",
        "t",
        due_at,
        Frequency::daily(1),
    )]);
    let events = record_events(&scheduler);

    for minute in [0, 1, 15, 59] {
        scheduler
            .run_once_at(due_at + chrono::Duration::minutes(minute))
            .await
            .expect("tick");
    }
    assert_eq!(drain(&events).len(), 1);
}

#[tokio::test]
async fn listener_failure_does_not_block_other_tasks() {
    let now = utc("2025-05-01T09:30:00Z");
    let tasks = vec![
        Task::new("a", "a", utc("2025-05-01T09:00:00Z"), Frequency::daily(1)),
        Task::new("b", "b", utc("2025-05-01T09:10:00Z"), Frequency::daily(1)),
    ];
    let (scheduler, _, _) = memory_scheduler(tasks);
    scheduler.on(EventKind::Due, |event| {
        if event.task_id == "a" {
            return Err(CadenceError::Listener("notification backend down".to_owned()));
        }
        Ok(())
    });
    let events = record_events(&scheduler);

    let report = scheduler.run_once_at(now).await.expect("tick");
    assert_eq!(report.due, 2);
    let ids: Vec<String> = drain(&events).into_iter().map(|e| e.task_id).collect();
    assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);
}

#[tokio::test]
async fn unsubscribed_listener_is_not_called() {
    let now = utc("2025-05-01T09:30:00Z");
    let (scheduler, _, _) = memory_scheduler(vec![Task::new(
        "a",
        "a",
        utc("2025-05-01T09:00:00Z"),
        Frequency::daily(1),
    )]);
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let subscription = scheduler.on(EventKind::Due, move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    });
    assert!(subscription.unsubscribe());

    scheduler.run_once_at(now).await.expect("tick");
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dedup_sets_stay_bounded() {
    let base = utc("2025-05-01T00:00:00Z");
    let tasks: Vec<Task> = (0..50)
        .map(|i| Task::new(format!("t{i}"), "t", base, Frequency::daily(1)))
        .collect();
    let store = Arc::new(MemoryTaskStore::new(tasks));
    let scheduler = Scheduler::builder(store, Arc::new(MemoryTimestampStore::new()))
        .with_config(SchedulerConfig {
            dedup_capacity: 20,
            ..SchedulerConfig::default()
        })
        .build()
        .expect("build");

    scheduler
        .run_once_at(base + chrono::Duration::minutes(5))
        .await
        .expect("tick");
    let (due, overdue) = scheduler.dedup_sizes();
    assert!(due <= 20, "due set holds {due} keys");
    assert_eq!(overdue, 0);
}

#[tokio::test]
async fn ledger_suppresses_duplicates_across_restarts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger_path = temp.path().join("occurrences.json");
    let now = utc("2025-05-01T09:30:00Z");
    let task = Task::new("a", "a", utc("2025-05-01T09:00:00Z"), Frequency::daily(1));

    let build = |store: Arc<MemoryTaskStore>| {
        Scheduler::builder(store, Arc::new(MemoryTimestampStore::new()))
            .with_ledger(OccurrenceLedger::new(&ledger_path))
            .build()
            .expect("build")
    };

    let first = build(Arc::new(MemoryTaskStore::new(vec![task.clone()])));
    assert_eq!(first.run_once_at(now).await.expect("tick").due, 1);
    assert!(ledger_path.exists());

    let restarted = build(Arc::new(MemoryTaskStore::new(vec![task])));
    assert_eq!(restarted.dedup_sizes().0, 1);
    assert_eq!(restarted.run_once_at(now).await.expect("tick").due, 0);
}

#[tokio::test]
async fn background_loop_picks_up_newly_due_tasks() {
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new(
        "soon",
        "soon",
        Utc::now() + chrono::Duration::milliseconds(1200),
        Frequency::daily(1),
    )]));
    let scheduler = Scheduler::builder(store, Arc::new(MemoryTimestampStore::new()))
        .with_config(SchedulerConfig {
            check_interval_secs: 1,
            ..SchedulerConfig::default()
        })
        .build()
        .expect("build");
    let mut rx = scheduler.subscribe(EventKind::Due);

    scheduler.start().await.expect("start");
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("due event within timeout")
        .expect("channel open");
    assert_eq!(event.task_id, "soon");
    scheduler.stop();
    assert!(!scheduler.is_running());
}
