//! Per-measurement phase journal
//!
//! The executor records the phase of a measurement before each step of the
//! swap and clears it once the measurement is done. An entry left behind
//! tells the next run where the previous one stopped, and in particular
//! whether the original measurement may already be gone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

/// State machine of one measurement's swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementPhase {
    Pending,
    DroppingTemp,
    Aggregating,
    DroppingOriginal,
    Restoring,
    DroppingTempAfterRestore,
    Done,
    Failed,
}

impl MeasurementPhase {
    /// From this phase on the original data may only exist in the staging measurement.
    pub fn original_at_risk(&self) -> bool {
        matches!(
            self,
            MeasurementPhase::DroppingOriginal
                | MeasurementPhase::Restoring
                | MeasurementPhase::DroppingTempAfterRestore
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementPhase::Pending => "pending",
            MeasurementPhase::DroppingTemp => "dropping_temp",
            MeasurementPhase::Aggregating => "aggregating",
            MeasurementPhase::DroppingOriginal => "dropping_original",
            MeasurementPhase::Restoring => "restoring",
            MeasurementPhase::DroppingTempAfterRestore => "dropping_temp_after_restore",
            MeasurementPhase::Done => "done",
            MeasurementPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for MeasurementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub database: String,
    pub measurement: String,
    pub temp_measurement: String,
    pub phase: MeasurementPhase,
    /// Phase that was running when the entry moved to `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<MeasurementPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn new(
        database: impl Into<String>,
        measurement: impl Into<String>,
        temp_measurement: impl Into<String>,
        phase: MeasurementPhase,
    ) -> Self {
        Self {
            database: database.into(),
            measurement: measurement.into(),
            temp_measurement: temp_measurement.into(),
            phase,
            failed_at: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Move the entry to `Failed`, remembering where it stopped.
    pub fn fail(mut self, error: impl fmt::Display) -> Self {
        if self.phase != MeasurementPhase::Failed {
            self.failed_at = Some(self.phase);
        }
        self.phase = MeasurementPhase::Failed;
        self.error = Some(error.to_string());
        self.updated_at = Utc::now();
        self
    }

    /// The last step that was started: `failed_at` for failures, `phase` for crashes.
    pub fn last_phase(&self) -> MeasurementPhase {
        match (self.phase, self.failed_at) {
            (MeasurementPhase::Failed, Some(failed_at)) => failed_at,
            (phase, _) => phase,
        }
    }

    /// Whether the swap must be finished before anything else touches the measurement.
    pub fn needs_resume(&self) -> bool {
        self.last_phase().original_at_risk()
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid checkpoint journal {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the entry of `(database, measurement)`.
    async fn record(&self, entry: CheckpointEntry) -> Result<(), CheckpointError>;

    async fn clear(&self, database: &str, measurement: &str) -> Result<(), CheckpointError>;

    /// Entries of `database`, oldest first.
    async fn entries(&self, database: &str) -> Result<Vec<CheckpointEntry>, CheckpointError>;
}

fn upsert(entries: &mut Vec<CheckpointEntry>, entry: CheckpointEntry) {
    match entries
        .iter_mut()
        .find(|e| e.database == entry.database && e.measurement == entry.measurement)
    {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }
}

fn remove(entries: &mut Vec<CheckpointEntry>, database: &str, measurement: &str) -> bool {
    let before = entries.len();
    entries.retain(|e| !(e.database == database && e.measurement == measurement));
    entries.len() != before
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    entries: Vec<CheckpointEntry>,
}

/// JSON journal on local disk, replaced atomically on every change.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn load(&self) -> Result<JournalFile, CheckpointError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JournalFile::default()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn store(&self, journal: &JournalFile) -> Result<(), CheckpointError> {
        if journal.entries.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(self.io_error(e)),
            };
        }

        let bytes = serde_json::to_vec_pretty(journal).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn record(&self, entry: CheckpointEntry) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut journal = self.load().await?;
        tracing::debug!(
            database = %entry.database,
            measurement = %entry.measurement,
            phase = %entry.phase,
            "Checkpoint"
        );
        upsert(&mut journal.entries, entry);
        self.store(&journal).await
    }

    async fn clear(&self, database: &str, measurement: &str) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut journal = self.load().await?;
        if remove(&mut journal.entries, database, measurement) {
            tracing::debug!(database, measurement, "Checkpoint cleared");
            self.store(&journal).await?;
        }
        Ok(())
    }

    async fn entries(&self, database: &str) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        let _guard = self.lock.lock().await;
        let journal = self.load().await?;
        Ok(journal
            .entries
            .into_iter()
            .filter(|e| e.database == database)
            .collect())
    }
}

/// Process-local journal.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<Vec<CheckpointEntry>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, database: &str, measurement: &str) -> Option<CheckpointEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.database == database && e.measurement == measurement)
            .cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn record(&self, entry: CheckpointEntry) -> Result<(), CheckpointError> {
        upsert(&mut *self.entries.lock().await, entry);
        Ok(())
    }

    async fn clear(&self, database: &str, measurement: &str) -> Result<(), CheckpointError> {
        remove(&mut *self.entries.lock().await, database, measurement);
        Ok(())
    }

    async fn entries(&self, database: &str) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.database == database)
            .cloned()
            .collect())
    }
}

/// Journal used when checkpointing is disabled or in dry-run mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpointStore;

#[async_trait]
impl CheckpointStore for NoopCheckpointStore {
    async fn record(&self, _entry: CheckpointEntry) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn clear(&self, _database: &str, _measurement: &str) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn entries(&self, _database: &str) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(measurement: &str, phase: MeasurementPhase) -> CheckpointEntry {
        CheckpointEntry::new(
            "telegraf",
            measurement,
            format!("{measurement}_downsample_temp"),
            phase,
        )
    }

    #[test]
    fn test_resume_decision() {
        for phase in [
            MeasurementPhase::Pending,
            MeasurementPhase::DroppingTemp,
            MeasurementPhase::Aggregating,
        ] {
            assert!(!entry("cpu", phase).needs_resume(), "{phase}");
            assert!(!entry("cpu", phase).fail("boom").needs_resume(), "{phase}");
        }
        for phase in [
            MeasurementPhase::DroppingOriginal,
            MeasurementPhase::Restoring,
            MeasurementPhase::DroppingTempAfterRestore,
        ] {
            assert!(entry("cpu", phase).needs_resume(), "{phase}");
            assert!(entry("cpu", phase).fail("boom").needs_resume(), "{phase}");
        }
    }

    #[test]
    fn test_fail_keeps_the_first_failed_phase() {
        let failed = entry("cpu", MeasurementPhase::Restoring)
            .fail("timeout")
            .fail("again");

        assert_eq!(failed.phase, MeasurementPhase::Failed);
        assert_eq!(failed.failed_at, Some(MeasurementPhase::Restoring));
        assert_eq!(failed.last_phase(), MeasurementPhase::Restoring);
        assert_eq!(failed.error.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.json");
        let store = FileCheckpointStore::new(&path);

        assert!(store.entries("telegraf").await.unwrap().is_empty());

        store
            .record(entry("cpu", MeasurementPhase::Aggregating))
            .await
            .unwrap();
        store
            .record(entry("mem", MeasurementPhase::DroppingTemp))
            .await
            .unwrap();
        store
            .record(entry("cpu", MeasurementPhase::Restoring).fail("killed"))
            .await
            .unwrap();
        assert!(path.exists());

        // A fresh store sees what the previous process left behind
        let reopened = FileCheckpointStore::new(&path);
        let entries = reopened.entries("telegraf").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].measurement, "cpu");
        assert_eq!(entries[0].failed_at, Some(MeasurementPhase::Restoring));
        assert!(reopened.entries("other").await.unwrap().is_empty());

        reopened.clear("telegraf", "cpu").await.unwrap();
        reopened.clear("telegraf", "mem").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileCheckpointStore::new(&path)
            .entries("telegraf")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        store
            .record(entry("cpu", MeasurementPhase::Pending))
            .await
            .unwrap();
        store
            .record(entry("cpu", MeasurementPhase::DroppingOriginal))
            .await
            .unwrap();

        let current = store.get("telegraf", "cpu").await.unwrap();
        assert_eq!(current.phase, MeasurementPhase::DroppingOriginal);
        assert_eq!(store.entries("telegraf").await.unwrap().len(), 1);

        store.clear("telegraf", "cpu").await.unwrap();
        assert!(store.get("telegraf", "cpu").await.is_none());
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&MeasurementPhase::DroppingTempAfterRestore).unwrap();
        assert_eq!(json, "\"dropping_temp_after_restore\"");
    }
}
