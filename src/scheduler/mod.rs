//! Reminder scheduler.
//!
//! Watches a task store on a fixed interval and emits `task:due` and
//! `task:overdue` events, at most once per occurrence. See [`Scheduler`].

pub mod dedup;
pub mod events;
pub mod ledger;
pub mod runner;
pub mod store;
pub mod task;

pub use dedup::{DedupSet, KeyPrecision, OccurrenceKey};
pub use events::{EventBus, EventContext, EventKind, Listener, Subscription, TaskEvent};
pub use ledger::{LedgerSnapshot, OccurrenceLedger};
pub use runner::{RecoveryReport, Scheduler, SchedulerBuilder, TickReport};
pub use store::{JsonTimestampStore, MemoryTaskStore, MemoryTimestampStore, TaskStore, TimestampStore};
pub use task::Task;
