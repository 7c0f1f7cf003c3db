//! Due/overdue event delivery.
//!
//! Listeners are plain callbacks registered per [`EventKind`]. Dispatch is
//! synchronous and in registration order; a listener that returns an error
//! or panics is logged and skipped, never propagated into the scheduler.

use crate::error::Result;
use crate::scheduler::task::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Event types emitted by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task:due")]
    Due,
    #[serde(rename = "task:overdue")]
    Overdue,
}

impl EventKind {
    /// Wire name, `task:due` or `task:overdue`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Due => "task:due",
            Self::Overdue => "task:overdue",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation hint carried with each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventContext {
    Today,
    Overdue,
}

/// Payload delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub task_id: String,
    /// The occurrence this event is about.
    pub due_at: DateTime<Utc>,
    pub context: EventContext,
    /// Task state at emission time.
    pub task: Task,
}

/// Callback invoked for each matching event.
pub type Listener = Arc<dyn Fn(&TaskEvent) -> Result<()> + Send + Sync>;

type ListenerMap = HashMap<EventKind, Vec<(u64, Listener)>>;

/// Registry of listeners keyed by event kind.
#[derive(Default)]
pub struct EventBus {
    listeners: Arc<Mutex<ListenerMap>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<EventKind, usize> = self
            .lock()
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ListenerMap> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `listener` for `kind`. Dropping the returned handle does not
    /// unregister; call [`Subscription::unsubscribe`].
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&TaskEvent) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::downgrade(&self.listeners),
            kind,
            id,
        }
    }

    /// Forward events of `kind` into an unbounded channel. Events sent after
    /// the receiver is dropped are discarded.
    pub fn subscribe(&self, kind: EventKind) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on(kind, move |event| {
            // A closed receiver is not an error for the scheduler.
            if tx.send(event.clone()).is_err() {
                debug!(kind = %event.kind, "event receiver dropped");
            }
            Ok(())
        });
        rx
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every listener of its kind. Returns how many
    /// listeners completed successfully.
    pub fn emit(&self, event: &TaskEvent) -> usize {
        // Clone out so listeners may (un)register without deadlocking.
        let listeners: Vec<Listener> = self
            .lock()
            .get(&event.kind)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    kind = %event.kind,
                    task_id = %event.task_id,
                    "event listener failed: {e}"
                ),
                Err(_) => error!(
                    kind = %event.kind,
                    task_id = %event.task_id,
                    "event listener panicked"
                ),
            }
        }
        delivered
    }
}

/// Handle returned by [`EventBus::on`].
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<ListenerMap>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut map = registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = map.get_mut(&self.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        before != list.len()
    }
}
