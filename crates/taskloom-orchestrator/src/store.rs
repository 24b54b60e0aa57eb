// Orchestrator Store
// Whole-document JSON persistence for tasks, worker pools and pipeline runs

use crate::error::{OrchestratorError, Result};
use crate::types::{StatusHistoryEntry, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const DOCUMENT_VERSION: u32 = 1;

/// Anything stored in a [`JsonCollection`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send {
    fn record_id(&self) -> &str;
}

impl Record for Task {
    fn record_id(&self) -> &str {
        &self.id
    }
}

#[derive(Serialize, Deserialize)]
struct Document<T> {
    version: u32,
    records: Vec<T>,
}

// ============================================================================
// JSON Collection
// ============================================================================

/// A collection persisted as one JSON document. Every mutation reads the
/// current file, applies the change and rewrites the whole document; the
/// in-process lock makes each read-modify-write atomic for this process,
/// while concurrent external writers resolve as last-write-wins.
pub struct JsonCollection<T> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> JsonCollection<T> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                OrchestratorError::IoError(format!("Failed to create store directory: {}", e))
            })?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_all(&self) -> Result<Vec<T>> {
        let _guard = self.guard()?;
        self.read_records()
    }

    pub fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|record| record.record_id() == id))
    }

    pub fn insert(&self, record: T) -> Result<()> {
        self.update_all(|records| {
            if records.iter().any(|r| r.record_id() == record.record_id()) {
                return Err(OrchestratorError::Validation(format!(
                    "Duplicate record id: {}",
                    record.record_id()
                )));
            }
            records.push(record);
            Ok(())
        })
    }

    /// Applies `f` to one record. Nothing is written when `f` fails.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        self.update_all(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.record_id() == id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("Record not found: {}", id)))?;
            f(record)
        })
    }

    /// Applies `f` to the whole collection. Nothing is written when `f` fails.
    pub fn update_all<R>(&self, f: impl FnOnce(&mut Vec<T>) -> Result<R>) -> Result<R> {
        let _guard = self.guard()?;
        let mut records = self.read_records()?;
        let out = f(&mut records)?;
        self.write_records(records)?;
        Ok(out)
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| OrchestratorError::IoError("Store lock poisoned".to_string()))
    }

    fn read_records(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| OrchestratorError::IoError(format!("Failed to read store file: {}", e)))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let document: Document<T> = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::ParseError(format!(
                "Failed to parse {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(document.records)
    }

    fn write_records(&self, records: Vec<T>) -> Result<()> {
        let document = Document {
            version: DOCUMENT_VERSION,
            records,
        };
        let content = serde_json::to_string_pretty(&document)?;
        atomic_write(&self.path, &content)
    }
}

// ============================================================================
// Task Store
// ============================================================================

/// Durable record of every task.
pub struct TaskStore {
    tasks: JsonCollection<Task>,
}

impl TaskStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            tasks: JsonCollection::open(data_dir.join("tasks.json"))?,
        })
    }

    pub fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .get(task_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Task not found: {}", task_id)))
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        self.tasks.load_all()
    }

    pub fn list_by_project(&self, project_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|task| task.project_id == project_id)
            .collect())
    }

    pub fn insert(&self, task: Task) -> Result<()> {
        self.tasks.insert(task)
    }

    pub fn update<R>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> Result<R>) -> Result<R> {
        self.tasks.update(task_id, f).map_err(|err| match err {
            OrchestratorError::NotFound(_) => {
                OrchestratorError::NotFound(format!("Task not found: {}", task_id))
            }
            other => other,
        })
    }

    /// Adds an audit note under the task's current status without changing it.
    pub fn append_history(&self, task_id: &str, message: &str, now: DateTime<Utc>) -> Result<Task> {
        self.update(task_id, |task| {
            let stamp = task
                .status_history
                .last()
                .map(|entry| entry.timestamp.max(now))
                .unwrap_or(now);
            task.status_history.push(StatusHistoryEntry {
                status: task.status,
                timestamp: stamp,
                message: message.to_string(),
            });
            task.updated_at = stamp;
            Ok(task.clone())
        })
    }

    pub fn delete(&self, task_id: &str) -> Result<Task> {
        self.tasks.update_all(|tasks| {
            let index = tasks
                .iter()
                .position(|t| t.id == task_id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("Task not found: {}", task_id)))?;
            if tasks[index].status == TaskStatus::Processing {
                return Err(OrchestratorError::Validation(format!(
                    "Task {} is processing and cannot be deleted",
                    task_id
                )));
            }
            Ok(tasks.remove(index))
        })
    }
}

/// Atomic write using temp file and rename
pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)
        .map_err(|e| OrchestratorError::IoError(format!("Failed to write temp file: {}", e)))?;

    fs::rename(&temp_path, path)
        .map_err(|e| OrchestratorError::IoError(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
