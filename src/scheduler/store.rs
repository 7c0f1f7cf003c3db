//! Persistence seams consumed by the scheduler.
//!
//! The scheduler never owns task data: it reads and writes tasks through a
//! [`TaskStore`] and keeps its last-run timestamp in a [`TimestampStore`].
//! In-memory implementations are provided for embedding and tests, plus a
//! JSON file-backed timestamp store.

use crate::error::{CadenceError, Result};
use crate::scheduler::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Source of truth for tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All tasks with `enabled == true`.
    async fn enabled_tasks(&self) -> Result<Vec<Task>>;

    /// Look up one task.
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Insert or replace a task.
    async fn save_task(&self, task: &Task) -> Result<()>;
}

/// Key/value store for scheduler timestamps.
#[async_trait]
pub trait TimestampStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    async fn save(&self, key: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Task store backed by a vector, preserving insertion order.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
        }
    }

    /// Snapshot of every task, enabled or not.
    pub fn all(&self) -> Vec<Task> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn enabled_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.iter().filter(|t| t.enabled).cloned().collect())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = tasks.iter_mut().find(|t| t.id == task.id) {
            *existing = task.clone();
        } else {
            tasks.push(task.clone());
        }
        Ok(())
    }
}

/// Timestamp store that forgets everything on drop.
#[derive(Debug, Default)]
pub struct MemoryTimestampStore {
    values: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryTimestampStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimestampStore for MemoryTimestampStore {
    async fn load(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).copied())
    }

    async fn save(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_owned(), at);
        Ok(())
    }
}

/// Timestamp store persisted as a JSON object in one file.
///
/// Writes go to a temp file that is renamed over the target, so a crash
/// mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct JsonTimestampStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonTimestampStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(CadenceError::Store(format!(
                    "cannot read timestamps from {}: {e}",
                    self.path.display()
                )));
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(values) => Ok(values),
            Err(e) => {
                warn!(
                    "ignoring malformed timestamp file at {}: {e}",
                    self.path.display()
                );
                Ok(HashMap::new())
            }
        }
    }
}

#[async_trait]
impl TimestampStore for JsonTimestampStore {
    async fn load(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_all().await?.get(key).copied())
    }

    async fn save(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_owned(), at);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CadenceError::Store(format!("cannot create timestamp directory: {e}"))
            })?;
        }
        let json = serde_json::to_vec_pretty(&values)
            .map_err(|e| CadenceError::Store(format!("cannot serialize timestamps: {e}")))?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| CadenceError::Store(format!("cannot write timestamp temp file: {e}")))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| CadenceError::Store(format!("cannot finalize timestamp file: {e}")))?;
        Ok(())
    }
}
