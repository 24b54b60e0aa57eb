// Task Queue
// The per-task state machine, concurrency ceiling, timeouts and retries

use crate::agents::AgentRegistry;
use crate::config::QueueConfig;
use crate::error::{OrchestratorError, Result};
use crate::instructions::build_instructions;
use crate::progress::{ProgressChannel, SnapshotOutcome};
use crate::scheduler::{count_active, select_dispatchable, QueueStats};
use crate::spawn::{SpawnAdapter, SpawnRequest};
use crate::store::TaskStore;
use crate::types::{
    FailureKind, NewTask, ProgressUpdate, QueueEvent, Task, TaskKind, TaskStatus,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use taskloom_observability::{emit_event, ObservabilityEvent};
use tokio::sync::{broadcast, RwLock};
use tracing::Level;

const EVENT_CAPACITY: usize = 1024;

// ============================================================================
// Reports
// ============================================================================

/// Whether a guarded transition changed the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The task was already terminal; nothing was written
    AlreadyTerminal(TaskStatus),
}

#[derive(Debug, Clone)]
pub struct TransitionReport {
    pub task: Task,
    pub outcome: TransitionOutcome,
}

#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub task: Task,
    pub accepted_artifacts: Vec<String>,
    /// Claimed artifacts that did not exist on disk. Reported, never fatal.
    pub missing_artifacts: Vec<String>,
    pub outcome: TransitionOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Another sweep was running, so this one did nothing
    pub skipped: bool,
    pub dispatched: Vec<String>,
    pub spawn_failures: Vec<String>,
    /// Launched, but the task left `active` (usually a cancel) before the
    /// worker could be recorded
    pub abandoned: Vec<String>,
}

/// Result of trying to launch one pending task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    /// No longer pending by the time it was claimed
    Skipped,
    Launched,
    SpawnFailed,
    Abandoned,
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// Task is not running; nothing to read
    Idle,
    /// The worker has not reported yet
    NoReport,
    Running { recorded: bool },
    SuccessCandidate,
    Completed(CompletionReport),
    Failed(TransitionReport),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckTask {
    pub task_id: String,
    pub title: String,
    pub last_activity_at: DateTime<Utc>,
    pub idle_minutes: i64,
}

/// Optional field changes applied together with a status change.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub result: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub assigned_worker: Option<String>,
    pub progress_channel_ref: Option<String>,
    pub progress: Option<u8>,
    pub current_step: Option<String>,
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Task Queue
// ============================================================================

/// Owns all scheduler state: the task table, the sweep flag and the queue
/// tunables.
pub struct TaskQueue {
    store: Arc<TaskStore>,
    spawner: Arc<dyn SpawnAdapter>,
    progress: Arc<dyn ProgressChannel>,
    agents: Arc<AgentRegistry>,
    config: RwLock<QueueConfig>,
    workspace_root: PathBuf,
    sweeping: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<TaskStore>,
        spawner: Arc<dyn SpawnAdapter>,
        progress: Arc<dyn ProgressChannel>,
        agents: Arc<AgentRegistry>,
        config: QueueConfig,
        workspace_root: PathBuf,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            spawner,
            progress,
            agents,
            config: RwLock::new(config),
            workspace_root,
            sweeping: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.workspace_root.join(project_id)
    }

    // ===== Configuration =====

    pub async fn queue_config(&self) -> QueueConfig {
        self.config.read().await.clone()
    }

    /// Takes effect on the next sweep.
    pub async fn update_queue_config(&self, config: QueueConfig) -> Result<()> {
        config.validate()?;
        tracing::info!(
            "Queue config updated: max_concurrent={} timeout={}m max_retries={} interval={}ms",
            config.max_concurrent_tasks,
            config.default_timeout_minutes,
            config.max_retries,
            config.processing_interval_ms
        );
        *self.config.write().await = config;
        Ok(())
    }

    // ===== Creation and queueing =====

    pub async fn create_task(&self, draft: NewTask) -> Result<Task> {
        if draft.title.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "Task title must not be empty".to_string(),
            ));
        }
        if draft.project_id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "Task project id must not be empty".to_string(),
            ));
        }
        if draft.timeout_minutes == Some(0) {
            return Err(OrchestratorError::Validation(
                "Task timeout must be at least one minute".to_string(),
            ));
        }
        if !draft.kind.is_container() {
            self.agents.resolve(&draft.agent_id)?;
        }

        let config = self.queue_config().await;
        let max_retries = draft.max_retries.unwrap_or(config.max_retries);
        let timeout_minutes = draft.timeout_minutes.unwrap_or(config.default_timeout_minutes);
        let working_directory = draft
            .working_directory
            .clone()
            .unwrap_or_else(|| self.project_dir(&draft.project_id));

        let task = Task::new(draft, max_retries, timeout_minutes, working_directory, Utc::now());
        self.store.insert(task.clone())?;

        tracing::info!("Created task {} ({}) for project {}", task.id, task.title, task.project_id);
        emit_transition(&task, "task_created", Level::INFO, None);
        self.publish(QueueEvent::TaskCreated {
            task_id: task.id.clone(),
            project_id: task.project_id.clone(),
            timestamp: task.created_at,
        });
        Ok(task)
    }

    /// `created → pending`, or a retry `failed → pending`. Any other state is
    /// left alone.
    pub async fn start_task(&self, task_id: &str) -> Result<Task> {
        let now = Utc::now();
        let (task, queued, retried) = self.store.update(task_id, |task| match task.status {
            TaskStatus::Created => {
                task.record_transition(TaskStatus::Pending, "Task queued", now);
                Ok((task.clone(), true, false))
            }
            TaskStatus::Failed if task.kind.is_container() => {
                Err(OrchestratorError::Validation(format!(
                    "Container task {} is reopened by retrying one of its workers",
                    task.id
                )))
            }
            TaskStatus::Failed => {
                if task.retry_count >= task.max_retries {
                    return Err(OrchestratorError::RetryLimitExceeded {
                        task_id: task.id.clone(),
                        retry_count: task.retry_count,
                        max_retries: task.max_retries,
                    });
                }
                task.retry_count += 1;
                task.progress = 0;
                task.current_step = None;
                task.result = None;
                task.error = None;
                task.failure_kind = None;
                task.assigned_worker = None;
                task.artifacts.clear();
                task.missing_artifacts.clear();
                task.started_at = None;
                task.completed_at = None;
                let message = format!("Retry {} of {}", task.retry_count, task.max_retries);
                task.record_transition(TaskStatus::Pending, &message, now);
                Ok((task.clone(), true, true))
            }
            _ => Ok((task.clone(), false, false)),
        })?;

        if retried {
            if let Err(e) = self.progress.clear(task_id) {
                tracing::warn!("Failed to clear stale progress for task {}: {}", task_id, e);
            }
        }
        if queued {
            tracing::info!("Task {} queued (retry {})", task.id, task.retry_count);
            emit_transition(&task, "task_queued", Level::INFO, None);
            self.publish(QueueEvent::TaskQueued {
                task_id: task.id.clone(),
                retry_count: task.retry_count,
                timestamp: task.updated_at,
            });
        }
        Ok(task)
    }

    /// Moves a pool or pipeline container straight to `active`. Containers
    /// never enter `processing`, so they hold no worker slot.
    pub(crate) fn start_container(&self, task_id: &str) -> Result<Task> {
        let now = Utc::now();
        let (task, changed) = self.store.update(task_id, |task| {
            if !task.kind.is_container() {
                return Err(OrchestratorError::Validation(format!(
                    "Task {} is not a container task",
                    task.id
                )));
            }
            if matches!(task.status, TaskStatus::Created | TaskStatus::Pending) {
                task.record_transition(TaskStatus::Active, "Container started", now);
                return Ok((task.clone(), true));
            }
            Ok((task.clone(), false))
        })?;
        if changed {
            emit_transition(&task, "container_started", Level::INFO, None);
        }
        Ok(task)
    }

    /// `failed → active` for a container whose failed child was re-queued.
    /// Returns false when the container was not failed.
    pub(crate) fn reopen_container(&self, task_id: &str, reason: &str) -> Result<bool> {
        let now = Utc::now();
        let reopened = self.store.update(task_id, |task| {
            if !task.kind.is_container() || task.status != TaskStatus::Failed {
                return Ok(None);
            }
            task.error = None;
            task.failure_kind = None;
            task.result = None;
            task.record_transition(TaskStatus::Active, reason, now);
            Ok(Some(task.clone()))
        })?;
        let Some(task) = reopened else {
            return Ok(false);
        };
        tracing::info!("Container {} reopened: {}", task.id, reason);
        emit_transition(&task, "container_reopened", Level::INFO, Some(reason));
        Ok(true)
    }

    // ===== Dispatch =====

    /// One scheduling sweep. Overlapping calls return immediately with
    /// `skipped` set.
    pub async fn process_queue(&self) -> Result<SweepReport> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Queue sweep already in progress; skipping");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }
        let _guard = SweepGuard(&self.sweeping);

        let max_concurrent = self.queue_config().await.max_concurrent_tasks as usize;
        let tasks = self.store.list()?;
        let active = count_active(&tasks);
        let available = max_concurrent.saturating_sub(active);
        let mut report = SweepReport::default();

        tracing::debug!(
            "Queue sweep: active={} max={} available={}",
            active,
            max_concurrent,
            available
        );
        if available == 0 {
            return Ok(report);
        }

        for candidate in select_dispatchable(&tasks, available) {
            match self.dispatch(&candidate.id).await {
                Ok(DispatchOutcome::Launched) => report.dispatched.push(candidate.id),
                Ok(DispatchOutcome::SpawnFailed) => report.spawn_failures.push(candidate.id),
                Ok(DispatchOutcome::Abandoned) => report.abandoned.push(candidate.id),
                Ok(DispatchOutcome::Skipped) => {}
                Err(e) => tracing::warn!("Failed to dispatch task {}: {}", candidate.id, e),
            }
        }
        Ok(report)
    }

    async fn dispatch(&self, task_id: &str) -> Result<DispatchOutcome> {
        let channel_ref = self.progress.channel_ref(task_id);
        let claimed = self.store.update(task_id, |task| {
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }
            task.progress_channel_ref = Some(channel_ref.clone());
            task.record_transition(TaskStatus::Active, "Dispatching to worker", Utc::now());
            Ok(Some(task.clone()))
        })?;
        let Some(task) = claimed else {
            return Ok(DispatchOutcome::Skipped);
        };
        emit_transition(&task, "task_dispatching", Level::DEBUG, None);

        let spawned = match self.agents.resolve(&task.agent_id) {
            Ok(agent) => {
                let request = SpawnRequest {
                    task_id: task.id.clone(),
                    agent: agent.clone(),
                    instructions: build_instructions(&task, agent, &channel_ref),
                    working_directory: task.working_directory.clone(),
                    timeout_minutes: task.timeout_minutes,
                    progress_channel_ref: channel_ref.clone(),
                };
                self.spawner.spawn(request).await
            }
            Err(e) => Err(OrchestratorError::SpawnFailure(e.to_string())),
        };

        match spawned {
            Ok(handle) => {
                let message = format!("Worker started ({})", handle.worker_handle);
                let started = self.store.update(task_id, |task| {
                    if task.status != TaskStatus::Active {
                        return Ok(None);
                    }
                    task.assigned_worker = Some(handle.worker_handle.clone());
                    task.progress_channel_ref = Some(handle.progress_channel_ref.clone());
                    task.record_transition(TaskStatus::Processing, &message, Utc::now());
                    Ok(Some(task.clone()))
                })?;
                let Some(task) = started else {
                    tracing::warn!(
                        "Task {} changed state while its worker was launching; worker {} left unsupervised",
                        task_id,
                        handle.worker_handle
                    );
                    return Ok(DispatchOutcome::Abandoned);
                };
                tracing::info!("Task {} dispatched to {}", task.id, handle.worker_handle);
                emit_transition(&task, "task_dispatched", Level::INFO, None);
                self.publish(QueueEvent::TaskDispatched {
                    task_id: task.id.clone(),
                    worker_handle: handle.worker_handle,
                    timestamp: task.updated_at,
                });
                Ok(DispatchOutcome::Launched)
            }
            Err(e) => {
                tracing::warn!("Spawn failed for task {}: {}", task_id, e);
                self.fail_with(task_id, FailureKind::Spawn, &e.to_string(), Utc::now())?;
                Ok(DispatchOutcome::SpawnFailed)
            }
        }
    }

    // ===== Terminal transitions =====

    /// Accepts a completion from `active|processing`. Already-terminal tasks
    /// are left untouched; the caller still gets a report so downstream
    /// checks can run.
    pub async fn on_task_complete(
        &self,
        task_id: &str,
        result: Option<String>,
        artifacts: Vec<String>,
    ) -> Result<CompletionReport> {
        let current = self.store.get(task_id)?;
        let (accepted, missing) = verify_artifacts(&current.working_directory, artifacts);
        let now = Utc::now();

        let report = self.store.update(task_id, |task| match task.status {
            TaskStatus::Active | TaskStatus::Processing => {
                task.result = result.clone();
                task.artifacts = accepted.clone();
                task.missing_artifacts = missing.clone();
                task.progress = 100;
                task.failure_kind = None;
                let message = if missing.is_empty() {
                    "Task completed".to_string()
                } else {
                    format!("Task completed ({} missing artifacts)", missing.len())
                };
                task.record_transition(TaskStatus::Completed, &message, now);
                Ok(CompletionReport {
                    task: task.clone(),
                    accepted_artifacts: accepted.clone(),
                    missing_artifacts: missing.clone(),
                    outcome: TransitionOutcome::Applied,
                })
            }
            status if status.is_terminal() => Ok(CompletionReport {
                task: task.clone(),
                accepted_artifacts: task.artifacts.clone(),
                missing_artifacts: task.missing_artifacts.clone(),
                outcome: TransitionOutcome::AlreadyTerminal(status),
            }),
            status => Err(OrchestratorError::InvalidTransition {
                task_id: task.id.clone(),
                from: status,
                to: TaskStatus::Completed,
            }),
        })?;

        match report.outcome {
            TransitionOutcome::Applied => {
                for path in &report.missing_artifacts {
                    tracing::warn!("Task {} claimed missing artifact {}", task_id, path);
                }
                tracing::info!("Task {} completed", task_id);
                emit_transition(&report.task, "task_completed", Level::INFO, None);
                self.publish(QueueEvent::TaskCompleted {
                    task_id: task_id.to_string(),
                    missing_artifacts: report.missing_artifacts.clone(),
                    timestamp: report.task.updated_at,
                });
            }
            TransitionOutcome::AlreadyTerminal(status) => {
                tracing::debug!("Completion for task {} ignored: already {}", task_id, status);
            }
        }
        Ok(report)
    }

    /// A worker-reported failure. Retrying is a separate `start_task` call.
    pub async fn on_task_error(&self, task_id: &str, error: &str) -> Result<TransitionReport> {
        self.fail_with(task_id, FailureKind::WorkerReported, error, Utc::now())
    }

    fn fail_with(
        &self,
        task_id: &str,
        kind: FailureKind,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionReport> {
        let report = self.store.update(task_id, |task| match task.status {
            TaskStatus::Active | TaskStatus::Processing => {
                task.error = Some(error.to_string());
                task.failure_kind = Some(kind);
                let message = format!("Task failed ({}): {}", kind.as_str(), error);
                task.record_transition(TaskStatus::Failed, &message, now);
                Ok(TransitionReport {
                    task: task.clone(),
                    outcome: TransitionOutcome::Applied,
                })
            }
            status if status.is_terminal() => Ok(TransitionReport {
                task: task.clone(),
                outcome: TransitionOutcome::AlreadyTerminal(status),
            }),
            status => Err(OrchestratorError::InvalidTransition {
                task_id: task.id.clone(),
                from: status,
                to: TaskStatus::Failed,
            }),
        })?;

        if report.outcome == TransitionOutcome::Applied {
            tracing::warn!("Task {} failed ({}): {}", task_id, kind.as_str(), error);
            let detail = taskloom_observability::redact_text(error);
            emit_transition(&report.task, "task_failed", Level::WARN, Some(&detail));
            self.publish(QueueEvent::TaskFailed {
                task_id: task_id.to_string(),
                kind,
                error: error.to_string(),
                timestamp: report.task.updated_at,
            });
        }
        Ok(report)
    }

    /// Bookkeeping only: a running worker is not signalled.
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<TransitionReport> {
        let now = Utc::now();
        let report = self.store.update(task_id, |task| {
            if task.status.is_terminal() {
                return Ok(TransitionReport {
                    task: task.clone(),
                    outcome: TransitionOutcome::AlreadyTerminal(task.status),
                });
            }
            let message = format!("Task cancelled: {}", reason);
            task.record_transition(TaskStatus::Cancelled, &message, now);
            Ok(TransitionReport {
                task: task.clone(),
                outcome: TransitionOutcome::Applied,
            })
        })?;

        if report.outcome == TransitionOutcome::Applied {
            tracing::info!("Task {} cancelled: {}", task_id, reason);
            emit_transition(&report.task, "task_cancelled", Level::INFO, None);
            self.publish(QueueEvent::TaskCancelled {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
                timestamp: report.task.updated_at,
            });
        }
        Ok(report)
    }

    /// Low-level setter. Rejects transitions the state machine does not allow
    /// and always appends a history entry.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: &str,
        update: TaskUpdate,
    ) -> Result<Task> {
        let now = Utc::now();
        let task = self.store.update(task_id, |task| {
            if !task.can_transition_to(status) {
                return Err(OrchestratorError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status,
                    to: status,
                });
            }
            apply_update(task, update);
            task.record_transition(status, message, now);
            Ok(task.clone())
        })?;
        emit_transition(&task, "task_status_updated", Level::INFO, Some(message));
        Ok(task)
    }

    // ===== Timeouts and diagnostics =====

    pub async fn check_timeouts(&self) -> Result<Vec<Task>> {
        self.check_timeouts_at(Utc::now()).await
    }

    /// Fails every processing worker task that has run longer than its
    /// timeout as of `now`. The worker process itself is not touched. A task
    /// that cannot be failed is logged and the sweep moves on.
    pub async fn check_timeouts_at(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut timed_out = Vec::new();
        for task in self.store.list()? {
            if task.status != TaskStatus::Processing || task.kind.is_container() {
                continue;
            }
            let Some(started_at) = task.started_at else {
                continue;
            };
            let limit = Duration::minutes(i64::from(task.timeout_minutes));
            if now - started_at <= limit {
                continue;
            }
            let error = format!("Timed out after {} minutes", task.timeout_minutes);
            match self.fail_with(&task.id, FailureKind::Timeout, &error, now) {
                Ok(report) if report.outcome == TransitionOutcome::Applied => {
                    timed_out.push(report.task)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to time out task {}: {}", task.id, e),
            }
        }
        Ok(timed_out)
    }

    /// Processing tasks with no sign of life for longer than the stuck
    /// threshold. Reported only.
    pub async fn stuck_tasks_at(&self, now: DateTime<Utc>) -> Result<Vec<StuckTask>> {
        let threshold = i64::from(self.queue_config().await.stuck_threshold_minutes);
        let stuck = self
            .store
            .list()?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Processing && !t.kind.is_container())
            .filter_map(|t| {
                let last = t.last_activity_at()?;
                let idle = (now - last).num_minutes();
                (idle > threshold).then(|| StuckTask {
                    task_id: t.id.clone(),
                    title: t.title.clone(),
                    last_activity_at: last,
                    idle_minutes: idle,
                })
            })
            .collect();
        Ok(stuck)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let max_concurrent = self.queue_config().await.max_concurrent_tasks as usize;
        Ok(QueueStats::from_tasks(&self.store.list()?, max_concurrent))
    }

    // ===== Progress polling =====

    /// Reads the task's latest snapshot and folds it into the record. Exit
    /// codes go through the same guarded completion and failure paths as
    /// external calls, so re-reading a stale snapshot is harmless.
    pub async fn poll_progress(&self, task_id: &str) -> Result<PollOutcome> {
        let task = self.store.get(task_id)?;
        if !task.status.is_running() || task.kind.is_container() {
            return Ok(PollOutcome::Idle);
        }
        let Some(snapshot) = self.progress.read(task_id)? else {
            return Ok(PollOutcome::NoReport);
        };
        let Some(stamp) = Utc.timestamp_millis_opt(snapshot.timestamp).single() else {
            tracing::warn!(
                "Ignoring progress for task {} with bad timestamp {}",
                task_id,
                snapshot.timestamp
            );
            return Ok(PollOutcome::Running { recorded: false });
        };

        let recorded = self.store.update(task_id, |task| {
            if !task.status.is_running() {
                return Ok(false);
            }
            let newer = task
                .progress_updates
                .last()
                .map_or(true, |last| stamp > last.timestamp);
            if !newer {
                return Ok(false);
            }
            task.progress_updates.push(ProgressUpdate {
                percentage: snapshot.percentage,
                message: snapshot.message.clone(),
                timestamp: stamp,
            });
            task.progress = task.progress.max(snapshot.percentage);
            task.current_step = Some(snapshot.message.clone());
            task.updated_at = task.updated_at.max(stamp);
            Ok(true)
        })?;
        if recorded {
            self.publish(QueueEvent::TaskProgress {
                task_id: task_id.to_string(),
                percentage: snapshot.percentage,
                message: snapshot.message.clone(),
                timestamp: stamp,
            });
        }

        match snapshot.outcome() {
            SnapshotOutcome::Running => Ok(PollOutcome::Running { recorded }),
            SnapshotOutcome::SuccessCandidate => {
                tracing::info!(
                    "Task {} reports 100% without an exit code; awaiting completion call",
                    task_id
                );
                Ok(PollOutcome::SuccessCandidate)
            }
            SnapshotOutcome::Succeeded => {
                let report = self
                    .on_task_complete(task_id, Some(snapshot.message), Vec::new())
                    .await?;
                Ok(PollOutcome::Completed(report))
            }
            SnapshotOutcome::Failed(code) => {
                let error = format!("Worker exited with code {}: {}", code, snapshot.message);
                let report = self.on_task_error(task_id, &error).await?;
                Ok(PollOutcome::Failed(report))
            }
        }
    }

    /// Polls every running worker task. A bad snapshot is logged and skipped.
    pub async fn poll_all_progress(&self) -> Result<Vec<(String, PollOutcome)>> {
        let running: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .filter(|t| t.status.is_running() && !t.kind.is_container())
            .map(|t| t.id)
            .collect();

        let mut outcomes = Vec::with_capacity(running.len());
        for task_id in running {
            match self.poll_progress(&task_id).await {
                Ok(outcome) => outcomes.push((task_id, outcome)),
                Err(e) => tracing::warn!("Progress poll failed for task {}: {}", task_id, e),
            }
        }
        Ok(outcomes)
    }

    // ===== Queries =====

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store.get(task_id)
    }

    pub fn list_tasks(&self, project_id: Option<&str>) -> Result<Vec<Task>> {
        match project_id {
            Some(project_id) => self.store.list_by_project(project_id),
            None => self.store.list(),
        }
    }

    pub fn delete_task(&self, task_id: &str) -> Result<Task> {
        let task = self.store.delete(task_id)?;
        if let Err(e) = self.progress.clear(task_id) {
            tracing::warn!("Failed to clear progress for deleted task {}: {}", task_id, e);
        }
        tracing::info!("Deleted task {}", task_id);
        Ok(task)
    }

    pub fn add_note(&self, task_id: &str, message: &str) -> Result<Task> {
        self.store.append_history(task_id, message, Utc::now())
    }
}

fn apply_update(task: &mut Task, update: TaskUpdate) {
    if let Some(result) = update.result {
        task.result = Some(result);
    }
    if let Some(error) = update.error {
        task.error = Some(error);
    }
    if let Some(kind) = update.failure_kind {
        task.failure_kind = Some(kind);
    }
    if let Some(worker) = update.assigned_worker {
        task.assigned_worker = Some(worker);
    }
    if let Some(channel_ref) = update.progress_channel_ref {
        task.progress_channel_ref = Some(channel_ref);
    }
    if let Some(progress) = update.progress {
        task.progress = task.progress.max(progress.min(100));
    }
    if let Some(step) = update.current_step {
        task.current_step = Some(step);
    }
}

/// Splits claimed artifacts into those present on disk and those missing.
/// Relative paths resolve against the task's working directory.
fn verify_artifacts(working_directory: &Path, artifacts: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut accepted = Vec::new();
    let mut missing = Vec::new();
    for artifact in artifacts {
        let path = Path::new(&artifact);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            working_directory.join(path)
        };
        if resolved.exists() {
            if !accepted.contains(&artifact) {
                accepted.push(artifact);
            }
        } else if !missing.contains(&artifact) {
            missing.push(artifact);
        }
    }
    (accepted, missing)
}

fn emit_transition(task: &Task, event: &str, level: Level, detail: Option<&str>) {
    let component = match task.kind {
        TaskKind::Worker => "queue",
        TaskKind::Pool => "pool",
        TaskKind::Pipeline => "pipeline",
    };
    let mut obs = ObservabilityEvent::new(component, event)
        .task(&task.id)
        .project(&task.project_id)
        .agent(&task.agent_id)
        .status(task.status.as_str());
    if let Some(link) = &task.link {
        obs = obs.pipeline(&link.parent_task_id);
        if let Some(step_id) = &link.step_id {
            obs = obs.step(step_id);
        }
    }
    if let Some(kind) = task.failure_kind {
        obs = obs.error_code(kind.as_str());
    }
    if let Some(detail) = detail {
        obs = obs.detail(detail);
    }
    emit_event(level, obs);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{MemoryProgressChannel, ProgressSnapshot};
    use crate::spawn::SpawnHandle;
    use crate::test_support::{build_queue, queue_harness};
    use crate::types::TaskPriority;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Blocks inside `spawn` until released, so a test can act while a
    /// worker is launching.
    #[derive(Default)]
    struct GatedSpawner {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SpawnAdapter for GatedSpawner {
        async fn spawn(&self, request: SpawnRequest) -> Result<SpawnHandle> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(SpawnHandle {
                worker_handle: "gated-1".to_string(),
                progress_channel_ref: request.progress_channel_ref,
                pid: None,
            })
        }
    }

    async fn started(queue: &TaskQueue, title: &str) -> Task {
        let task = queue
            .create_task(NewTask::new("p1", title, "worker"))
            .await
            .unwrap();
        queue.start_task(&task.id).await.unwrap()
    }

    fn assert_history_consistent(task: &Task) {
        assert!(!task.status_history.is_empty());
        assert_eq!(task.status_history.last().unwrap().status, task.status);
        assert!(task
            .status_history
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn create_task_validates_draft() {
        let h = queue_harness(3);

        let blank = h.queue.create_task(NewTask::new("p1", "  ", "worker")).await;
        assert!(matches!(blank, Err(OrchestratorError::Validation(_))));

        let unknown = h.queue.create_task(NewTask::new("p1", "x", "ghost")).await;
        assert!(matches!(unknown, Err(OrchestratorError::Validation(_))));
        assert!(h.queue.list_tasks(None).unwrap().is_empty());

        let task = h
            .queue
            .create_task(NewTask::new("p1", "x", "worker"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.timeout_minutes, 30);
        assert_eq!(task.working_directory, h.temp.path().join("workspaces/p1"));
        assert_history_consistent(&task);
    }

    #[tokio::test]
    async fn start_task_is_noop_beyond_pending() {
        let h = queue_harness(3);
        let task = started(&h.queue, "a").await;
        assert_eq!(task.status, TaskStatus::Pending);

        let again = h.queue.start_task(&task.id).await.unwrap();
        assert_eq!(again.status, TaskStatus::Pending);
        assert_eq!(again.status_history.len(), task.status_history.len());
    }

    #[tokio::test]
    async fn sweep_dispatches_by_priority_up_to_ceiling() {
        let h = queue_harness(2);
        let low = h
            .queue
            .create_task(NewTask::new("p1", "low", "worker").with_priority(TaskPriority::Low))
            .await
            .unwrap();
        let urgent = h
            .queue
            .create_task(NewTask::new("p1", "urgent", "tester").with_priority(TaskPriority::Urgent))
            .await
            .unwrap();
        let medium = h
            .queue
            .create_task(NewTask::new("p1", "medium", "worker"))
            .await
            .unwrap();
        for id in [&low.id, &urgent.id, &medium.id] {
            h.queue.start_task(id).await.unwrap();
        }

        let report = h.queue.process_queue().await.unwrap();

        assert_eq!(report.dispatched, vec![urgent.id.clone(), medium.id.clone()]);
        let urgent = h.queue.get_task(&urgent.id).unwrap();
        assert_eq!(urgent.status, TaskStatus::Processing);
        assert_eq!(urgent.assigned_worker.as_deref(), Some("fake-1"));
        assert!(urgent.started_at.is_some());
        assert_history_consistent(&urgent);
        assert_eq!(h.queue.get_task(&low.id).unwrap().status, TaskStatus::Pending);

        let launched = h.spawner.launched();
        assert_eq!(launched[0].agent.id, "tester");
        assert!(launched[0].instructions.contains("# Task: urgent"));

        let second = h.queue.process_queue().await.unwrap();
        assert!(second.dispatched.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_fails_task_and_retry_requeues() {
        let h = queue_harness(3);
        h.spawner.fail_agent("worker");
        let task = started(&h.queue, "doomed").await;

        let report = h.queue.process_queue().await.unwrap();
        assert_eq!(report.spawn_failures, vec![task.id.clone()]);

        let failed = h.queue.get_task(&task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.failure_kind, Some(FailureKind::Spawn));
        assert!(failed.error.as_deref().unwrap().contains("scripted failure"));
        assert!(failed.completed_at.is_some());

        let retried = h.queue.start_task(&task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.is_none());
        assert!(retried.completed_at.is_none());
    }

    #[tokio::test]
    async fn retry_limit_is_enforced() {
        let h = queue_harness(3);
        let task = h
            .queue
            .create_task(NewTask::new("p1", "flaky", "worker").with_max_retries(1))
            .await
            .unwrap();
        h.queue.start_task(&task.id).await.unwrap();

        for _ in 0..2 {
            h.queue.process_queue().await.unwrap();
            h.queue.on_task_error(&task.id, "crashed").await.unwrap();
            let _ = h.queue.start_task(&task.id).await;
        }

        let result = h.queue.start_task(&task.id).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::RetryLimitExceeded {
                retry_count: 1,
                max_retries: 1,
                ..
            })
        ));
        let stuck = h.queue.get_task(&task.id).unwrap();
        assert_eq!(stuck.status, TaskStatus::Failed);
        assert_eq!(stuck.retry_count, 1);
    }

    #[tokio::test]
    async fn completion_is_idempotent_and_verifies_artifacts() {
        let h = queue_harness(3);
        let task = started(&h.queue, "writer").await;
        h.queue.process_queue().await.unwrap();
        let workdir = h.temp.path().join("workspaces/p1");
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::write(workdir.join("real.txt"), "ok").unwrap();

        let first = h
            .queue
            .on_task_complete(
                &task.id,
                Some("done".to_string()),
                vec!["real.txt".to_string(), "out.txt".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(first.outcome, TransitionOutcome::Applied);
        assert_eq!(first.task.status, TaskStatus::Completed);
        assert_eq!(first.accepted_artifacts, vec!["real.txt"]);
        assert_eq!(first.missing_artifacts, vec!["out.txt"]);

        let second = h
            .queue
            .on_task_complete(&task.id, Some("again".to_string()), Vec::new())
            .await
            .unwrap();
        assert_eq!(
            second.outcome,
            TransitionOutcome::AlreadyTerminal(TaskStatus::Completed)
        );
        assert_eq!(second.task.result.as_deref(), Some("done"));
        assert_eq!(second.task.artifacts, vec!["real.txt"]);
        assert_eq!(second.task.status_history.len(), first.task.status_history.len());
    }

    #[tokio::test]
    async fn complete_before_dispatch_is_rejected() {
        let h = queue_harness(3);
        let task = started(&h.queue, "early").await;
        let result = h.queue.on_task_complete(&task.id, None, Vec::new()).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn timeout_fires_only_after_limit() {
        let h = queue_harness(3);
        let task = h
            .queue
            .create_task(NewTask::new("p1", "slow", "worker").with_timeout_minutes(60))
            .await
            .unwrap();
        h.queue.start_task(&task.id).await.unwrap();
        h.queue.process_queue().await.unwrap();
        let started_at = h.queue.get_task(&task.id).unwrap().started_at.unwrap();

        let early = h
            .queue
            .check_timeouts_at(started_at + Duration::minutes(60))
            .await
            .unwrap();
        assert!(early.is_empty());

        let late = h
            .queue
            .check_timeouts_at(started_at + Duration::minutes(61))
            .await
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].status, TaskStatus::Failed);
        assert_eq!(late[0].failure_kind, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn one_minute_timeout_fails_after_sixty_one_minutes() {
        let h = queue_harness(3);
        let task = h
            .queue
            .create_task(NewTask::new("p1", "quick", "worker").with_timeout_minutes(1))
            .await
            .unwrap();
        h.queue.start_task(&task.id).await.unwrap();
        h.queue.process_queue().await.unwrap();
        let started_at = h.queue.get_task(&task.id).unwrap().started_at.unwrap();

        let fired = h
            .queue
            .check_timeouts_at(started_at + Duration::minutes(61))
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].error.as_deref().unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn poller_records_progress_and_completes_on_exit_zero() {
        let h = queue_harness(3);
        let task = started(&h.queue, "polled").await;
        assert!(matches!(
            h.queue.poll_progress(&task.id).await.unwrap(),
            PollOutcome::Idle
        ));
        h.queue.process_queue().await.unwrap();
        assert!(matches!(
            h.queue.poll_progress(&task.id).await.unwrap(),
            PollOutcome::NoReport
        ));

        let mut snapshot = ProgressSnapshot::new(40, "editing");
        h.progress.write(&task.id, &snapshot).unwrap();
        assert!(matches!(
            h.queue.poll_progress(&task.id).await.unwrap(),
            PollOutcome::Running { recorded: true }
        ));
        assert!(matches!(
            h.queue.poll_progress(&task.id).await.unwrap(),
            PollOutcome::Running { recorded: false }
        ));

        snapshot.percentage = 100;
        snapshot.message = "all done".to_string();
        snapshot.timestamp += 1_000;
        h.progress.write(&task.id, &snapshot).unwrap();
        assert!(matches!(
            h.queue.poll_progress(&task.id).await.unwrap(),
            PollOutcome::SuccessCandidate
        ));
        assert_eq!(h.queue.get_task(&task.id).unwrap().status, TaskStatus::Processing);

        snapshot.timestamp += 1_000;
        h.progress.write(&task.id, &snapshot.clone().with_exit_code(0)).unwrap();
        match h.queue.poll_progress(&task.id).await.unwrap() {
            PollOutcome::Completed(report) => {
                assert_eq!(report.task.result.as_deref(), Some("all done"));
                assert_eq!(report.task.progress_updates.len(), 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            h.queue.poll_progress(&task.id).await.unwrap(),
            PollOutcome::Idle
        ));
    }

    #[tokio::test]
    async fn poller_fails_on_nonzero_exit() {
        let h = queue_harness(3);
        let task = started(&h.queue, "crashy").await;
        h.queue.process_queue().await.unwrap();
        h.progress
            .write(&task.id, &ProgressSnapshot::new(10, "segfault").with_exit_code(139))
            .unwrap();

        let outcomes = h.queue.poll_all_progress().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let failed = h.queue.get_task(&task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.failure_kind, Some(FailureKind::WorkerReported));
        assert!(failed.error.as_deref().unwrap().contains("139"));
    }

    #[tokio::test]
    async fn cancel_pending_prevents_dispatch() {
        let h = queue_harness(3);
        let task = started(&h.queue, "unwanted").await;

        let report = h.queue.cancel_task(&task.id, "operator").await.unwrap();
        assert_eq!(report.outcome, TransitionOutcome::Applied);
        let report = h.queue.cancel_task(&task.id, "operator").await.unwrap();
        assert_eq!(
            report.outcome,
            TransitionOutcome::AlreadyTerminal(TaskStatus::Cancelled)
        );

        let sweep = h.queue.process_queue().await.unwrap();
        assert!(sweep.dispatched.is_empty());
        assert!(h.spawner.launched().is_empty());
    }

    #[tokio::test]
    async fn stuck_tasks_are_reported_not_failed() {
        let h = queue_harness(3);
        let task = started(&h.queue, "quiet").await;
        h.queue.process_queue().await.unwrap();
        let started_at = h.queue.get_task(&task.id).unwrap().started_at.unwrap();

        let fresh = h
            .queue
            .stuck_tasks_at(started_at + Duration::minutes(5))
            .await
            .unwrap();
        assert!(fresh.is_empty());

        let stuck = h
            .queue
            .stuck_tasks_at(started_at + Duration::minutes(25))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].idle_minutes, 25);
        assert_eq!(h.queue.get_task(&task.id).unwrap().status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn update_task_status_rejects_illegal_moves() {
        let h = queue_harness(3);
        let task = h
            .queue
            .create_task(NewTask::new("p1", "manual", "worker"))
            .await
            .unwrap();

        let bad = h
            .queue
            .update_task_status(&task.id, TaskStatus::Completed, "skip ahead", TaskUpdate::default())
            .await;
        assert!(matches!(bad, Err(OrchestratorError::InvalidTransition { .. })));

        let ok = h
            .queue
            .update_task_status(&task.id, TaskStatus::Pending, "manual queue", TaskUpdate::default())
            .await
            .unwrap();
        assert_eq!(ok.status_history.last().unwrap().message, "manual queue");
    }

    #[tokio::test]
    async fn events_are_published() {
        let h = queue_harness(3);
        let mut rx = h.queue.subscribe();
        let task = started(&h.queue, "observed").await;

        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::TaskCreated { .. }));
        match rx.recv().await.unwrap() {
            QueueEvent::TaskQueued { task_id, retry_count, .. } => {
                assert_eq!(task_id, task.id);
                assert_eq!(retry_count, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn queue_config_updates_apply_to_next_sweep() {
        let h = queue_harness(1);
        started(&h.queue, "a").await;
        started(&h.queue, "b").await;
        assert_eq!(h.queue.process_queue().await.unwrap().dispatched.len(), 1);

        let mut config = h.queue.queue_config().await;
        config.max_concurrent_tasks = 2;
        h.queue.update_queue_config(config).await.unwrap();

        assert_eq!(h.queue.process_queue().await.unwrap().dispatched.len(), 1);
        let stats = h.queue.queue_stats().await.unwrap();
        assert_eq!(stats.processing, 2);
        assert_eq!(stats.available_slots, 0);

        let mut zero = h.queue.queue_config().await;
        zero.max_concurrent_tasks = 0;
        assert!(h.queue.update_queue_config(zero).await.is_err());
    }

    #[tokio::test]
    async fn five_minute_timeout_is_strictly_greater_than() {
        let h = queue_harness(3);
        let task = h
            .queue
            .create_task(NewTask::new("p1", "short", "worker").with_timeout_minutes(5))
            .await
            .unwrap();
        h.queue.start_task(&task.id).await.unwrap();
        h.queue.process_queue().await.unwrap();
        let started_at = h.queue.get_task(&task.id).unwrap().started_at.unwrap();

        let at_limit = h
            .queue
            .check_timeouts_at(started_at + Duration::minutes(5))
            .await
            .unwrap();
        assert!(at_limit.is_empty());
        assert_eq!(h.queue.get_task(&task.id).unwrap().status, TaskStatus::Processing);

        let past = h
            .queue
            .check_timeouts_at(started_at + Duration::minutes(5) + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(past.len(), 1);
        assert_eq!(past[0].error.as_deref(), Some("Timed out after 5 minutes"));
    }

    #[tokio::test]
    async fn timeout_sweep_fails_every_expired_task() {
        let h = queue_harness(3);
        let mut ids = Vec::new();
        for title in ["one", "two", "three"] {
            let task = h
                .queue
                .create_task(NewTask::new("p1", title, "worker").with_timeout_minutes(2))
                .await
                .unwrap();
            h.queue.start_task(&task.id).await.unwrap();
            ids.push(task.id);
        }
        h.queue.process_queue().await.unwrap();
        h.queue.on_task_complete(&ids[1], None, Vec::new()).await.unwrap();
        let latest = ids
            .iter()
            .filter_map(|id| h.queue.get_task(id).unwrap().started_at)
            .max()
            .unwrap();

        let fired = h
            .queue
            .check_timeouts_at(latest + Duration::minutes(3))
            .await
            .unwrap();

        let mut fired: Vec<String> = fired.into_iter().map(|t| t.id).collect();
        fired.sort();
        let mut expected = vec![ids[0].clone(), ids[2].clone()];
        expected.sort();
        assert_eq!(fired, expected);
        assert_eq!(h.queue.get_task(&ids[1]).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_during_launch_is_reported_as_abandoned() {
        let temp = tempfile::tempdir().unwrap();
        let spawner = Arc::new(GatedSpawner::default());
        let queue = build_queue(
            &temp,
            3,
            spawner.clone(),
            Arc::new(MemoryProgressChannel::new()),
        );
        let task = started(&queue, "racy").await;

        let sweep = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_queue().await }
        });
        spawner.entered.notified().await;
        queue.cancel_task(&task.id, "operator").await.unwrap();
        spawner.release.notify_one();
        let report = sweep.await.unwrap().unwrap();

        assert!(report.dispatched.is_empty());
        assert_eq!(report.abandoned, vec![task.id.clone()]);
        let task = queue.get_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.assigned_worker.is_none());
        assert_history_consistent(&task);
    }

    #[tokio::test]
    async fn containers_start_active_and_reopen_from_failed() {
        let h = queue_harness(1);
        let mut draft = NewTask::new("p1", "pipeline", "pipeline");
        draft.kind = TaskKind::Pipeline;
        let parent = h.queue.create_task(draft).await.unwrap();

        let started = h.queue.start_container(&parent.id).unwrap();
        assert_eq!(started.status, TaskStatus::Active);
        assert!(started.started_at.is_some());
        assert_eq!(h.queue.queue_stats().await.unwrap().available_slots, 1);
        assert!(!h.queue.reopen_container(&parent.id, "not failed").unwrap());

        h.queue.on_task_error(&parent.id, "step failed").await.unwrap();
        assert!(matches!(
            h.queue.start_task(&parent.id).await,
            Err(OrchestratorError::Validation(_))
        ));

        assert!(h.queue.reopen_container(&parent.id, "step retried").unwrap());
        let reopened = h.queue.get_task(&parent.id).unwrap();
        assert_eq!(reopened.status, TaskStatus::Active);
        assert!(reopened.error.is_none());
        assert!(reopened.completed_at.is_none());
        assert_history_consistent(&reopened);
    }
}
