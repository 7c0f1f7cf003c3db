//! Cadence: recurrence computation and reminder scheduling.
//!
//! Given a recurring task's frequency and its current due instant, cadence
//! computes the next occurrence, and on a running clock decides which tasks
//! are due or have slipped into missed status:
//!
//! - [`recurrence`]: timezone-aware date arithmetic, the built-in daily,
//!   weekly and monthly frequencies, and RRULE-based custom frequencies
//!   backed by an LRU cache of compiled rules.
//! - [`scheduler`]: a polling scheduler that emits at most one due and one
//!   overdue event per occurrence, recovers occurrences missed while the
//!   process was down, and applies completions, delays and skips.

pub mod config;
pub mod error;
pub mod recurrence;
pub mod scheduler;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use recurrence::{Frequency, RecurrenceEngine, RuleCache, TimezoneHandler};
pub use scheduler::{EventKind, Scheduler, Task, TaskEvent};
