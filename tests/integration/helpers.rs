//! Shared helpers for integration tests.

use cadence::scheduler::{
    EventKind, MemoryTaskStore, MemoryTimestampStore, Scheduler, TaskEvent,
};
use cadence::Task;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Parse an RFC 3339 instant.
pub(crate) fn utc(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid RFC 3339 instant")
}

/// Scheduler over in-memory stores holding `tasks`.
pub(crate) fn memory_scheduler(
    tasks: Vec<Task>,
) -> (Scheduler, Arc<MemoryTaskStore>, Arc<MemoryTimestampStore>) {
    let store = Arc::new(MemoryTaskStore::new(tasks));
    let timestamps = Arc::new(MemoryTimestampStore::new());
    let scheduler = Scheduler::builder(store.clone(), timestamps.clone())
        .build()
        .expect("build scheduler");
    (scheduler, store, timestamps)
}

/// Record every event of both kinds, in emission order.
pub(crate) fn record_events(scheduler: &Scheduler) -> Arc<Mutex<Vec<TaskEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::Due, EventKind::Overdue] {
        let sink = Arc::clone(&events);
        scheduler.on(kind, move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
    }
    events
}

/// Take the events recorded so far.
pub(crate) fn drain(events: &Arc<Mutex<Vec<TaskEvent>>>) -> Vec<TaskEvent> {
    std::mem::take(&mut *events.lock().unwrap())
}
