//! Occurrence keys and bounded duplicate-suppression sets.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Default number of keys a [`DedupSet`] holds before trimming.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Resolution of an occurrence key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPrecision {
    /// `YYYY-MM-DDTHH` in UTC. Re-checks within the same hour collapse.
    #[default]
    Hour,
    /// Full instant to the second.
    Exact,
}

/// `"<task id>@<instant>"` token identifying one occurrence of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OccurrenceKey(String);

impl OccurrenceKey {
    pub fn new(task_id: &str, at: DateTime<Utc>, precision: KeyPrecision) -> Self {
        let stamp = match precision {
            KeyPrecision::Hour => at.format("%Y-%m-%dT%H").to_string(),
            KeyPrecision::Exact => at.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        Self(format!("{task_id}@{stamp}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Insertion-ordered set of occurrence keys with a soft cap.
///
/// The set may exceed `capacity` between calls to [`trim`](Self::trim),
/// which drops the oldest keys and keeps the most recent half.
#[derive(Debug, Clone)]
pub struct DedupSet {
    order: VecDeque<OccurrenceKey>,
    members: HashSet<OccurrenceKey>,
    capacity: usize,
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild from keys in insertion order.
    pub fn from_keys(capacity: usize, keys: impl IntoIterator<Item = OccurrenceKey>) -> Self {
        let mut set = Self::new(capacity);
        for key in keys {
            set.insert(key);
        }
        set.trim();
        set
    }

    /// Record `key`; returns `false` if it was already present.
    pub fn insert(&mut self, key: OccurrenceKey) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &OccurrenceKey) -> bool {
        self.members.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &OccurrenceKey> {
        self.order.iter()
    }

    /// When over capacity, keep only the newest `capacity / 2` keys.
    /// Returns the number of keys dropped.
    pub fn trim(&mut self) -> usize {
        if self.order.len() <= self.capacity {
            return 0;
        }
        let keep = self.capacity / 2;
        let drop_count = self.order.len() - keep;
        for key in self.order.drain(..drop_count) {
            self.members.remove(&key);
        }
        drop_count
    }
}
