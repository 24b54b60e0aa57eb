//! Latest-snapshot progress reporting between workers and the orchestrator.
//!
//! A worker overwrites its task's snapshot whenever it has something to say;
//! the orchestrator reads the snapshot on demand. There is no queue: a reader
//! only ever sees the most recent write.

use crate::error::{OrchestratorError, Result};
use crate::store::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Entire content of a task's progress resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProgressSnapshot {
    pub percentage: u8,
    pub message: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// What a snapshot says about the worker's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Running,
    /// Full progress without an exit code; the caller still has to confirm
    SuccessCandidate,
    Succeeded,
    Failed(i32),
}

impl ProgressSnapshot {
    pub fn new(percentage: u8, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.percentage > 100 {
            return Err(OrchestratorError::Validation(format!(
                "Progress percentage {} is out of range 0-100",
                self.percentage
            )));
        }
        Ok(())
    }

    pub fn outcome(&self) -> SnapshotOutcome {
        match self.exit_code {
            Some(0) => SnapshotOutcome::Succeeded,
            Some(code) => SnapshotOutcome::Failed(code),
            None if self.percentage >= 100 => SnapshotOutcome::SuccessCandidate,
            None => SnapshotOutcome::Running,
        }
    }
}

/// Swappable medium for progress snapshots.
pub trait ProgressChannel: Send + Sync {
    fn write(&self, task_id: &str, snapshot: &ProgressSnapshot) -> Result<()>;

    /// `Ok(None)` means the worker has not reported yet.
    fn read(&self, task_id: &str) -> Result<Option<ProgressSnapshot>>;

    fn clear(&self, task_id: &str) -> Result<()>;

    /// Opaque reference handed to the worker so it knows where to write.
    fn channel_ref(&self, task_id: &str) -> String;
}

// ============================================================================
// File channel
// ============================================================================

/// One `<task_id>.json` file per task under a directory.
pub struct FileProgressChannel {
    dir: PathBuf,
}

impl FileProgressChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            OrchestratorError::IoError(format!("Failed to create progress directory: {}", e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }
}

impl ProgressChannel for FileProgressChannel {
    fn write(&self, task_id: &str, snapshot: &ProgressSnapshot) -> Result<()> {
        snapshot.validate()?;
        let content = serde_json::to_string(snapshot)?;
        atomic_write(&self.path_for(task_id), &content)
    }

    fn read(&self, task_id: &str) -> Result<Option<ProgressSnapshot>> {
        let path = self.path_for(task_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(OrchestratorError::IoError(format!(
                    "Failed to read progress file {}: {}",
                    path.display(),
                    err
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let snapshot: ProgressSnapshot = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::ParseError(format!("Invalid progress snapshot for {}: {}", task_id, e))
        })?;
        snapshot.validate()?;
        Ok(Some(snapshot))
    }

    fn clear(&self, task_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(task_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(OrchestratorError::IoError(format!(
                "Failed to clear progress file: {}",
                err
            ))),
        }
    }

    fn channel_ref(&self, task_id: &str) -> String {
        self.path_for(task_id).display().to_string()
    }
}

// ============================================================================
// In-memory channel
// ============================================================================

/// Channel for embedders that relay worker reports over their own transport.
#[derive(Default)]
pub struct MemoryProgressChannel {
    snapshots: RwLock<HashMap<String, ProgressSnapshot>>,
}

impl MemoryProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressChannel for MemoryProgressChannel {
    fn write(&self, task_id: &str, snapshot: &ProgressSnapshot) -> Result<()> {
        snapshot.validate()?;
        let mut guard = self
            .snapshots
            .write()
            .map_err(|_| OrchestratorError::IoError("Progress lock poisoned".to_string()))?;
        guard.insert(task_id.to_string(), snapshot.clone());
        Ok(())
    }

    fn read(&self, task_id: &str) -> Result<Option<ProgressSnapshot>> {
        let guard = self
            .snapshots
            .read()
            .map_err(|_| OrchestratorError::IoError("Progress lock poisoned".to_string()))?;
        Ok(guard.get(task_id).cloned())
    }

    fn clear(&self, task_id: &str) -> Result<()> {
        let mut guard = self
            .snapshots
            .write()
            .map_err(|_| OrchestratorError::IoError("Progress lock poisoned".to_string()))?;
        guard.remove(task_id);
        Ok(())
    }

    fn channel_ref(&self, task_id: &str) -> String {
        format!("memory://progress/{}", task_id)
    }
}
