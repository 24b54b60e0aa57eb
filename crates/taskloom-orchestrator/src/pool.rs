// Worker Pools
// Fans one logical task out to several workers and merges what they produce

use crate::error::{OrchestratorError, Result};
use crate::queue::TaskQueue;
use crate::store::{atomic_write, JsonCollection, Record};
use crate::types::{NewTask, QueueEvent, Task, TaskLink, TaskPriority, TaskStatus, WorkerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskloom_observability::{emit_event, ObservabilityEvent};
use tracing::Level;

pub const MAX_POOL_WORKERS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// Disjoint scope slices, no coordination
    #[default]
    Split,
    /// Shared coordination file, no pre-partitioning
    Collaborative,
    /// One primary produces, the rest review once it completes
    Review,
}

impl PoolStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Split => "split",
            Self::Collaborative => "collaborative",
            Self::Review => "review",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedOutput {
    pub result: String,
    pub artifacts: Vec<String>,
    pub completed_workers: usize,
    pub failed_workers: usize,
    pub merged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPool {
    pub pool_id: String,
    pub parent_task_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub agent_id: String,
    pub strategy: PoolStrategy,
    pub worker_count: u32,
    pub title: String,
    pub instructions: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Child tasks in worker order. Review pools grow this when reviewers start.
    #[serde(default)]
    pub child_task_ids: Vec<String>,
    #[serde(default)]
    pub reviewers_dispatched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_context_file: Option<PathBuf>,
    pub working_directory: PathBuf,
    pub priority: TaskPriority,
    /// The parent is a pool container this pool completes on merge
    #[serde(default)]
    pub owns_parent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<MergedOutput>,
    pub created_at: DateTime<Utc>,
}

impl Record for WorkerPool {
    fn record_id(&self) -> &str {
        &self.pool_id
    }
}

impl WorkerPool {
    /// Scope lines for worker `index`: explicit scopes dealt round-robin.
    pub fn scope_for(&self, index: u32) -> Vec<String> {
        self.scopes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i as u32 % self.worker_count == index)
            .map(|(_, scope)| scope.clone())
            .collect()
    }
}

/// Caller's description of a pool to start.
#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub parent_task_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub worker_count: u32,
    pub strategy: PoolStrategy,
    pub title: String,
    pub instructions: String,
    pub scopes: Vec<String>,
    pub step_id: Option<String>,
    pub shared_context_file: Option<PathBuf>,
    pub working_directory: Option<PathBuf>,
    pub priority: TaskPriority,
    pub owns_parent: bool,
}

impl PoolRequest {
    pub fn new(
        parent_task_id: impl Into<String>,
        project_id: impl Into<String>,
        agent_id: impl Into<String>,
        worker_count: u32,
        strategy: PoolStrategy,
    ) -> Self {
        Self {
            parent_task_id: parent_task_id.into(),
            project_id: project_id.into(),
            agent_id: agent_id.into(),
            worker_count,
            strategy,
            title: String::new(),
            instructions: String::new(),
            scopes: Vec::new(),
            step_id: None,
            shared_context_file: None,
            working_directory: None,
            priority: TaskPriority::Medium,
            owns_parent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCompletion {
    pub pool_id: String,
    pub all_workers: usize,
    pub completed_workers: usize,
    pub failed_workers: usize,
    pub complete: bool,
}

// ============================================================================
// Pool Manager
// ============================================================================

pub struct WorkerPoolManager {
    queue: Arc<TaskQueue>,
    pools: JsonCollection<WorkerPool>,
}

impl WorkerPoolManager {
    pub fn new(queue: Arc<TaskQueue>, data_dir: &Path) -> Result<Self> {
        Ok(Self {
            queue,
            pools: JsonCollection::open(data_dir.join("pools.json"))?,
        })
    }

    pub fn get_pool(&self, pool_id: &str) -> Result<WorkerPool> {
        self.pools
            .get(pool_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Worker pool not found: {}", pool_id)))
    }

    /// Creates the pool record and its first wave of child tasks, queued for
    /// dispatch. Review pools start with the primary only.
    pub async fn create_worker_pool(&self, request: PoolRequest) -> Result<WorkerPool> {
        if request.worker_count == 0 || request.worker_count > MAX_POOL_WORKERS {
            return Err(OrchestratorError::Validation(format!(
                "Worker count must be between 1 and {}, got {}",
                MAX_POOL_WORKERS, request.worker_count
            )));
        }
        self.queue.agents().resolve(&request.agent_id)?;
        let parent = self.queue.get_task(&request.parent_task_id)?;

        let pool_id = uuid::Uuid::new_v4().to_string();
        let working_directory = request
            .working_directory
            .clone()
            .unwrap_or_else(|| self.queue.project_dir(&request.project_id));
        let title = if request.title.trim().is_empty() {
            parent.title.clone()
        } else {
            request.title.clone()
        };

        let coordination_file = if request.strategy == PoolStrategy::Collaborative {
            let path = working_directory
                .join(".taskloom")
                .join("pools")
                .join(&pool_id)
                .join("COORDINATION.md");
            write_coordination_skeleton(&path, &title, request.worker_count)?;
            Some(path)
        } else {
            None
        };

        let pool = WorkerPool {
            pool_id,
            parent_task_id: request.parent_task_id,
            project_id: request.project_id,
            step_id: request.step_id,
            agent_id: request.agent_id,
            strategy: request.strategy,
            worker_count: request.worker_count,
            title,
            instructions: request.instructions,
            scopes: request.scopes,
            child_task_ids: Vec::new(),
            reviewers_dispatched: false,
            coordination_file,
            shared_context_file: request.shared_context_file,
            working_directory,
            priority: request.priority,
            owns_parent: request.owns_parent,
            merged: None,
            created_at: Utc::now(),
        };
        self.pools.insert(pool.clone())?;

        if pool.owns_parent {
            self.queue.start_container(&pool.parent_task_id)?;
        }

        let first_wave: Vec<(u32, WorkerRole)> = match pool.strategy {
            PoolStrategy::Review => vec![(0, WorkerRole::Primary)],
            _ => (0..pool.worker_count).map(|i| (i, WorkerRole::Peer)).collect(),
        };
        for (index, role) in first_wave {
            self.spawn_child(&pool, index, role, None).await?;
        }

        tracing::info!(
            "Worker pool {} ({} x{}) created for task {}",
            pool.pool_id,
            pool.strategy.as_str(),
            pool.worker_count,
            pool.parent_task_id
        );
        emit_pool_event(&pool, "pool_created", None);
        self.get_pool(&pool.pool_id)
    }

    async fn spawn_child(
        &self,
        pool: &WorkerPool,
        index: u32,
        role: WorkerRole,
        primary: Option<&Task>,
    ) -> Result<Task> {
        let mut draft = NewTask::new(
            pool.project_id.clone(),
            format!("{} [{}/{}]", pool.title, index + 1, pool.worker_count),
            pool.agent_id.clone(),
        )
        .with_description(child_description(pool, index, role, primary))
        .with_priority(pool.priority)
        .with_working_directory(pool.working_directory.clone());
        draft.link = Some(TaskLink {
            parent_task_id: pool.parent_task_id.clone(),
            pool_id: pool.pool_id.clone(),
            step_id: pool.step_id.clone(),
            worker_index: index,
            worker_count: pool.worker_count,
            role,
        });

        let task = self.queue.create_task(draft).await?;
        let child_id = task.id.clone();
        self.pools.update(&pool.pool_id, |p| {
            p.child_task_ids.push(child_id);
            Ok(())
        })?;
        self.queue.start_task(&task.id).await
    }

    /// Reacts to a child reaching a terminal state. For review pools this is
    /// where reviewers are started once the primary has completed.
    pub async fn on_worker_terminal(&self, child: &Task) -> Result<Option<WorkerPool>> {
        let Some(link) = &child.link else {
            return Ok(None);
        };
        let pool = self.get_pool(&link.pool_id)?;

        if pool.strategy == PoolStrategy::Review
            && link.role == WorkerRole::Primary
            && child.status == TaskStatus::Completed
            && pool.worker_count > 1
        {
            let claimed = self.pools.update(&pool.pool_id, |p| {
                if p.reviewers_dispatched {
                    return Ok(false);
                }
                p.reviewers_dispatched = true;
                Ok(true)
            })?;
            if claimed {
                for index in 1..pool.worker_count {
                    self.spawn_child(&pool, index, WorkerRole::Reviewer, Some(child))
                        .await?;
                }
                tracing::info!(
                    "Primary {} of pool {} completed; {} reviewers queued",
                    child.id,
                    pool.pool_id,
                    pool.worker_count - 1
                );
            }
        }

        self.get_pool(&pool.pool_id).map(Some)
    }

    /// Complete when every child is terminal and no further wave is due.
    /// Failed children are counted, never retried here.
    pub fn check_worker_pool_completion(&self, pool_id: &str) -> Result<PoolCompletion> {
        let pool = self.get_pool(pool_id)?;
        let children = self.children(&pool)?;

        let completed_workers = children
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed_workers = children
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .count();
        let all_terminal = !children.is_empty() && children.iter().all(|t| t.status.is_terminal());

        let waves_done = match pool.strategy {
            PoolStrategy::Review => {
                let primary_completed = children
                    .first()
                    .map_or(false, |t| t.status == TaskStatus::Completed);
                pool.worker_count == 1 || pool.reviewers_dispatched || !primary_completed
            }
            _ => children.len() == pool.worker_count as usize,
        };

        Ok(PoolCompletion {
            pool_id: pool.pool_id,
            all_workers: children.len(),
            completed_workers,
            failed_workers,
            complete: all_terminal && waves_done,
        })
    }

    /// Concatenates worker results in worker order and de-duplicates their
    /// artifacts. Repeated calls return the stored merge.
    pub async fn merge_worker_outputs(&self, pool_id: &str) -> Result<MergedOutput> {
        let pool = self.get_pool(pool_id)?;
        if let Some(merged) = pool.merged {
            return Ok(merged);
        }
        let completion = self.check_worker_pool_completion(pool_id)?;
        if !completion.complete {
            return Err(OrchestratorError::WorkerPoolIncomplete(format!(
                "Pool {} has {} of {} workers finished",
                pool_id,
                completion.completed_workers + completion.failed_workers,
                pool.worker_count
            )));
        }

        let children = self.children(&pool)?;
        let mut sections = Vec::with_capacity(children.len());
        let mut artifacts: Vec<String> = Vec::new();
        for (index, child) in children.iter().enumerate() {
            let body = match child.status {
                TaskStatus::Completed => child.result.clone().unwrap_or_default(),
                _ => format!(
                    "({}) {}",
                    child.status,
                    child.error.clone().unwrap_or_default()
                ),
            };
            sections.push(format!(
                "## Worker {} ({})\n\n{}",
                index + 1,
                child.agent_id,
                body.trim()
            ));
            for artifact in &child.artifacts {
                if !artifacts.contains(artifact) {
                    artifacts.push(artifact.clone());
                }
            }
        }
        let candidate = MergedOutput {
            result: sections.join("\n\n"),
            artifacts,
            completed_workers: completion.completed_workers,
            failed_workers: completion.failed_workers,
            merged_at: Utc::now(),
        };

        let (merged, fresh) = self.pools.update(pool_id, |p| match &p.merged {
            Some(existing) => Ok((existing.clone(), false)),
            None => {
                p.merged = Some(candidate.clone());
                Ok((candidate, true))
            }
        })?;
        if !fresh {
            return Ok(merged);
        }

        if pool.owns_parent {
            self.finish_parent(&pool, &merged).await?;
        }
        tracing::info!(
            "Merged pool {} ({} completed, {} failed)",
            pool_id,
            merged.completed_workers,
            merged.failed_workers
        );
        emit_pool_event(&pool, "pool_merged", None);
        self.queue.publish(QueueEvent::PoolMerged {
            pool_id: pool_id.to_string(),
            parent_task_id: pool.parent_task_id.clone(),
            timestamp: merged.merged_at,
        });
        Ok(merged)
    }

    /// Drops the recorded merge after a child was re-queued so the pool
    /// merges again once that worker finishes. A parent container that
    /// failed with this pool goes back to `active`.
    pub fn reopen(&self, pool_id: &str, reason: &str) -> Result<()> {
        let pool = self.get_pool(pool_id)?;
        if pool.owns_parent {
            self.queue.reopen_container(&pool.parent_task_id, reason)?;
        }
        let cleared = self.pools.update(pool_id, |p| Ok(p.merged.take().is_some()))?;
        if cleared {
            tracing::info!("Pool {} reopened: {}", pool_id, reason);
            emit_pool_event(&pool, "pool_reopened", Some(reason));
        }
        Ok(())
    }

    async fn finish_parent(&self, pool: &WorkerPool, merged: &MergedOutput) -> Result<()> {
        if merged.completed_workers > 0 {
            self.queue
                .on_task_complete(
                    &pool.parent_task_id,
                    Some(merged.result.clone()),
                    merged.artifacts.clone(),
                )
                .await?;
        } else {
            self.queue
                .on_task_error(&pool.parent_task_id, "Every pool worker failed")
                .await?;
        }
        Ok(())
    }

    fn children(&self, pool: &WorkerPool) -> Result<Vec<Task>> {
        pool.child_task_ids
            .iter()
            .map(|id| self.queue.get_task(id))
            .collect()
    }
}

fn child_description(pool: &WorkerPool, index: u32, role: WorkerRole, primary: Option<&Task>) -> String {
    let mut out = pool.instructions.trim().to_string();
    if !out.is_empty() {
        out.push_str("\n\n");
    }

    match (pool.strategy, role) {
        (PoolStrategy::Split, _) => {
            let scope = pool.scope_for(index);
            if scope.is_empty() {
                out.push_str(&format!(
                    "Handle slice {} of {} of this work. Other workers own the remaining slices; \
do not touch their part.\n",
                    index + 1,
                    pool.worker_count
                ));
            } else {
                out.push_str("Your scope (do not modify anything outside it):\n");
                for item in scope {
                    out.push_str(&format!("- {}\n", item));
                }
            }
        }
        (PoolStrategy::Collaborative, _) => {
            if let Some(path) = &pool.coordination_file {
                out.push_str(&format!(
                    "Read `{}` before acting and append what you did and what you plan next \
after every change.\n",
                    path.display()
                ));
            }
        }
        (PoolStrategy::Review, WorkerRole::Reviewer) => {
            if let Some(primary) = primary {
                out.push_str(&format!(
                    "Review the work of the primary worker (task `{}`). Its summary:\n\n{}\n",
                    primary.id,
                    primary.result.as_deref().unwrap_or("(no summary)")
                ));
            }
        }
        (PoolStrategy::Review, _) => {
            out.push_str(&format!(
                "You are the primary worker. {} reviewer(s) will examine your output when you finish.\n",
                pool.worker_count.saturating_sub(1)
            ));
        }
    }

    if let Some(path) = &pool.shared_context_file {
        out.push_str(&format!(
            "\nPipeline shared context: `{}`. Read it first; add your notes under the notes section.\n",
            path.display()
        ));
    }
    out
}

fn write_coordination_skeleton(path: &Path, title: &str, workers: u32) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            OrchestratorError::IoError(format!("Failed to create coordination directory: {}", e))
        })?;
    }
    let content = format!(
        "# Coordination: {}\n\n{} workers share this file. Read it before acting; append, never rewrite.\n\n## Log\n\n",
        title, workers
    );
    atomic_write(path, &content)
}

fn emit_pool_event(pool: &WorkerPool, event: &str, detail: Option<&str>) {
    let mut obs = ObservabilityEvent::new("pool", event)
        .task(&pool.parent_task_id)
        .project(&pool.project_id)
        .agent(&pool.agent_id)
        .status(pool.strategy.as_str());
    if let Some(step_id) = &pool.step_id {
        obs = obs.pipeline(&pool.parent_task_id).step(step_id);
    }
    if let Some(detail) = detail {
        obs = obs.detail(detail);
    }
    emit_event(Level::INFO, obs);
}
