//! File-backed snapshot of the dedup sets.
//!
//! Without it, a restart forgets which occurrences were already announced
//! and an occurrence still inside its due hour is announced again.

use crate::error::{CadenceError, Result};
use crate::scheduler::dedup::OccurrenceKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Persisted keys, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default = "default_ledger_version")]
    pub version: u8,
    #[serde(default)]
    pub due: Vec<OccurrenceKey>,
    #[serde(default)]
    pub overdue: Vec<OccurrenceKey>,
}

fn default_ledger_version() -> u8 {
    1
}

/// JSON ledger of announced occurrence keys.
#[derive(Debug, Clone)]
pub struct OccurrenceLedger {
    path: PathBuf,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl OccurrenceLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot; a missing or malformed file yields an empty one.
    ///
    /// Called once while the scheduler is being built, before any runtime
    /// work starts.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Store`] when the file exists but cannot be read.
    pub fn load(&self) -> Result<LedgerSnapshot> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerSnapshot::default());
            }
            Err(e) => {
                return Err(CadenceError::Store(format!(
                    "failed to read occurrence ledger: {e}"
                )));
            }
        };

        match serde_json::from_slice::<LedgerSnapshot>(&bytes) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::warn!(
                    "ignoring malformed occurrence ledger at {}: {e}",
                    self.path.display()
                );
                Ok(LedgerSnapshot::default())
            }
        }
    }

    /// Replace the ledger contents atomically.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Store`] on serialization or I/O failure.
    pub async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let json = serde_json::to_vec(snapshot)
            .map_err(|e| CadenceError::Store(format!("failed to serialize ledger: {e}")))?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CadenceError::Store(format!("failed to create occurrence ledger directory: {e}"))
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| CadenceError::Store(format!("failed to write ledger temp file: {e}")))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| CadenceError::Store(format!("failed to finalize ledger file: {e}")))?;
        Ok(())
    }
}
