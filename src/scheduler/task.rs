//! Recurring task definitions.

use crate::recurrence::Frequency;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recurring obligation tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Current occurrence.
    pub due_at: DateTime<Utc>,
    /// How the task repeats.
    pub frequency: Frequency,
    /// Disabled tasks are never checked or recovered.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Last time the task was marked done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Creation time; the first occurrence of the series.
    pub created_at: DateTime<Utc>,
    /// Delays since the last completion.
    #[serde(default)]
    pub snooze_count: u32,
    /// Total completions.
    #[serde(default)]
    pub completion_count: u32,
    /// Consecutive on-time completions.
    #[serde(default)]
    pub streak: u32,
    /// Occurrences that passed without completion.
    #[serde(default)]
    pub miss_count: u32,
    /// Occurrences explicitly skipped.
    #[serde(default)]
    pub skip_count: u32,
}

fn default_enabled() -> bool {
    true
}

impl Task {
    /// Create an enabled task first due at `due_at`.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        due_at: DateTime<Utc>,
        frequency: Frequency,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            due_at,
            frequency,
            enabled: true,
            last_completed_at: None,
            created_at: due_at,
            snooze_count: 0,
            completion_count: 0,
            streak: 0,
            miss_count: 0,
            skip_count: 0,
        }
    }

    /// `true` if the task was completed at or after `occurrence`.
    pub fn completed_since(&self, occurrence: DateTime<Utc>) -> bool {
        self.last_completed_at.is_some_and(|done| done >= occurrence)
    }
}
