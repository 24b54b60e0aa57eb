// Orchestrator Types
// Task records, the task state machine, and queue events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Task State
// ============================================================================

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Recorded but not yet queued
    Created,
    /// Queued, waiting for a concurrency slot
    Pending,
    /// Slot taken, worker launch in flight
    Active,
    /// Worker launched and running
    Processing,
    Completed,
    /// Terminal unless explicitly retried
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Holds a concurrency slot.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Processing)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Pending)
                | (Failed, Pending)
                | (Pending, Active)
                | (Active, Processing)
                | (Active, Completed)
                | (Processing, Completed)
                | (Active, Failed)
                | (Processing, Failed)
                | (Created, Cancelled)
                | (Pending, Cancelled)
                | (Active, Cancelled)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch ordering among pending tasks. Declaration order is the sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Ordinary tasks are dispatched to a worker. Container tasks stand for a
/// whole worker pool or pipeline and are never dispatched themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Worker,
    Pool,
    Pipeline,
}

impl TaskKind {
    pub fn is_container(self) -> bool {
        !matches!(self, Self::Worker)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Spawn,
    Timeout,
    WorkerReported,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Timeout => "timeout",
            Self::WorkerReported => "worker_reported",
        }
    }
}

/// Role of a fanned-out worker inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Peer,
    Primary,
    Reviewer,
}

/// Ties a child task back to the pool (and pipeline step) that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLink {
    pub parent_task_id: String,
    pub pool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub worker_index: u32,
    pub worker_count: u32,
    pub role: WorkerRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percentage: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Task
// ============================================================================

/// Caller-supplied description of a task to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewTask {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub agent_id: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub link: Option<TaskLink>,
}

impl NewTask {
    pub fn new(
        project_id: impl Into<String>,
        title: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            description: String::new(),
            agent_id: agent_id.into(),
            priority: TaskPriority::Medium,
            max_retries: None,
            timeout_minutes: None,
            working_directory: None,
            kind: TaskKind::Worker,
            link: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// A single schedulable unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_channel_ref: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Verified artifact paths, in the order the worker reported them
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Claimed artifacts that did not exist when the task completed
    #[serde(default)]
    pub missing_artifacts: Vec<String>,
    pub status_history: Vec<StatusHistoryEntry>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub progress_updates: Vec<ProgressUpdate>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_minutes: u32,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<TaskLink>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        draft: NewTask,
        max_retries: u32,
        timeout_minutes: u32,
        working_directory: PathBuf,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: draft.project_id,
            title: draft.title,
            description: draft.description,
            kind: draft.kind,
            status: TaskStatus::Created,
            priority: draft.priority,
            agent_id: draft.agent_id,
            assigned_worker: None,
            progress_channel_ref: None,
            result: None,
            error: None,
            failure_kind: None,
            artifacts: Vec::new(),
            missing_artifacts: Vec::new(),
            status_history: vec![StatusHistoryEntry {
                status: TaskStatus::Created,
                timestamp: now,
                message: "Task created".to_string(),
            }],
            progress: 0,
            progress_updates: Vec::new(),
            current_step: None,
            retry_count: 0,
            max_retries,
            timeout_minutes,
            working_directory,
            link: draft.link,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Containers never hold a worker slot: they go straight to `active`
    /// when their pool or pipeline starts, and a failed container may be
    /// reopened to `active` when one of its children is retried.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if !self.kind.is_container() {
            return self.status.can_transition_to(next);
        }
        match (self.status, next) {
            (_, TaskStatus::Processing) => false,
            (TaskStatus::Created | TaskStatus::Pending | TaskStatus::Failed, TaskStatus::Active) => {
                true
            }
            (from, to) => from.can_transition_to(to),
        }
    }

    /// Applies `next` and appends the matching history entry. History
    /// timestamps never go backwards, even if `now` does.
    pub fn record_transition(&mut self, next: TaskStatus, message: &str, now: DateTime<Utc>) {
        let stamp = self
            .status_history
            .last()
            .map(|entry| entry.timestamp.max(now))
            .unwrap_or(now);

        self.status = next;
        match next {
            TaskStatus::Processing => {
                self.started_at.get_or_insert(stamp);
            }
            TaskStatus::Active if self.kind.is_container() => {
                self.started_at.get_or_insert(stamp);
                self.completed_at = None;
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(stamp);
            }
            _ => self.completed_at = None,
        }
        self.status_history.push(StatusHistoryEntry {
            status: next,
            timestamp: stamp,
            message: message.to_string(),
        });
        self.updated_at = stamp;
    }

    /// Timestamp of the most recent sign of life from the worker.
    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        let last_progress = self.progress_updates.last().map(|u| u.timestamp);
        match (self.started_at, last_progress) {
            (Some(started), Some(progress)) => Some(started.max(progress)),
            (started, progress) => started.or(progress),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Lifecycle events published on the orchestrator event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    TaskCreated {
        task_id: String,
        project_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskQueued {
        task_id: String,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },
    TaskDispatched {
        task_id: String,
        worker_handle: String,
        timestamp: DateTime<Utc>,
    },
    TaskProgress {
        task_id: String,
        percentage: u8,
        message: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: String,
        missing_artifacts: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        kind: FailureKind,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    StepStatusChanged {
        pipeline_id: String,
        step_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    PoolMerged {
        pool_id: String,
        parent_task_id: String,
        timestamp: DateTime<Utc>,
    },
}
