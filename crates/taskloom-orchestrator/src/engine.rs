// Orchestrator Engine
// Owns the queue, pools and pipelines and routes terminal events between them

use crate::agents::AgentRegistry;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{PipelineConfig, PipelineRun, PipelineRunner};
use crate::pool::{PoolRequest, PoolStrategy, WorkerPool, WorkerPoolManager};
use crate::progress::{FileProgressChannel, ProgressChannel};
use crate::queue::{CompletionReport, PollOutcome, TaskQueue, TransitionReport};
use crate::spawn::{ProcessSpawnAdapter, SpawnAdapter};
use crate::store::TaskStore;
use crate::types::{NewTask, QueueEvent, Task, TaskKind, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use taskloom_observability::{emit_event, LoggingHandle, ObservabilityEvent};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// What one `tick` did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub timed_out: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub dispatched: Vec<String>,
    pub spawn_failures: Vec<String>,
    pub abandoned: Vec<String>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: Arc<TaskQueue>,
    pools: Arc<WorkerPoolManager>,
    pipelines: Arc<PipelineRunner>,
}

impl Orchestrator {
    /// Process-spawning orchestrator with file progress channels under the
    /// data directory.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let progress = Arc::new(FileProgressChannel::new(config.progress_dir())?);
        let spawner = Arc::new(ProcessSpawnAdapter::new(
            config.process.clone(),
            config.instructions_dir(),
        ));
        Self::with_adapters(config, spawner, progress)
    }

    pub fn with_adapters(
        config: OrchestratorConfig,
        spawner: Arc<dyn SpawnAdapter>,
        progress: Arc<dyn ProgressChannel>,
    ) -> Result<Self> {
        config.validate()?;

        let mut agents = AgentRegistry::new(config.agents.clone());
        let loaded = agents.load_dir(&config.data_dir.join("agents"))?;
        if loaded > 0 {
            tracing::info!("Loaded {} agent profiles", loaded);
        }

        let store = Arc::new(TaskStore::new(&config.data_dir)?);
        let queue = Arc::new(TaskQueue::new(
            store,
            spawner,
            progress,
            Arc::new(agents),
            config.queue.clone(),
            config.workspace_root.clone(),
        ));
        let pools = Arc::new(WorkerPoolManager::new(queue.clone(), &config.data_dir)?);
        let pipelines = Arc::new(PipelineRunner::new(
            queue.clone(),
            pools.clone(),
            &config.data_dir,
            config.step_failure_policy,
        )?);

        Ok(Self {
            config,
            queue,
            pools,
            pipelines,
        })
    }

    /// Daily JSONL logs under `<dataDir>/logs`, pruned per `config.logging`.
    /// Keep the handle alive for as long as the process logs.
    pub fn init_logging(config: &OrchestratorConfig) -> Result<LoggingHandle> {
        let handle = taskloom_observability::init_logging(&config.logging, &config.logs_dir())
            .map_err(|e| OrchestratorError::IoError(format!("Failed to initialize logging: {}", e)))?;
        if !handle.info.pruned.is_empty() {
            tracing::info!("Pruned {} expired log files", handle.info.pruned.len());
        }
        Ok(handle)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn pools(&self) -> &Arc<WorkerPoolManager> {
        &self.pools
    }

    pub fn pipelines(&self) -> &Arc<PipelineRunner> {
        &self.pipelines
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    // ===== Task entry points =====

    /// Creates and queues a standalone worker task.
    pub async fn submit(&self, draft: NewTask) -> Result<Task> {
        let task = self.queue.create_task(draft).await?;
        self.queue.start_task(&task.id).await
    }

    /// Creates a pool container task and fans its work out to
    /// `worker_count` workers running `draft.agent_id`.
    pub async fn create_pool_task(
        &self,
        draft: NewTask,
        worker_count: u32,
        strategy: PoolStrategy,
        scopes: Vec<String>,
    ) -> Result<(Task, WorkerPool)> {
        self.queue.agents().resolve(&draft.agent_id)?;
        let mut container = draft.clone();
        container.kind = TaskKind::Pool;
        container.link = None;
        let parent = self.queue.create_task(container).await?;

        let mut request = PoolRequest::new(
            &parent.id,
            &draft.project_id,
            &draft.agent_id,
            worker_count,
            strategy,
        );
        request.title = draft.title.clone();
        request.instructions = draft.description.clone();
        request.scopes = scopes;
        request.priority = draft.priority;
        request.working_directory = draft.working_directory.clone();
        request.owns_parent = true;

        let pool = match self.pools.create_worker_pool(request).await {
            Ok(pool) => pool,
            Err(e) => {
                self.queue.cancel_task(&parent.id, "Worker pool could not be created").await?;
                return Err(e);
            }
        };
        Ok((self.queue.get_task(&parent.id)?, pool))
    }

    pub async fn create_pipeline_task(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        config: PipelineConfig,
    ) -> Result<Task> {
        self.pipelines
            .create_pipeline_task(project_id, title, description, config)
            .await
    }

    pub fn pipeline_status(&self, pipeline_id: &str) -> Result<PipelineRun> {
        self.pipelines.pipeline_status(pipeline_id)
    }

    // ===== Completion signalling =====

    /// External completion. Repeats leave the task alone but still run the
    /// pool and pipeline checks.
    pub async fn complete(
        &self,
        task_id: &str,
        result: Option<String>,
        artifacts: Vec<String>,
    ) -> Result<CompletionReport> {
        let report = self.queue.on_task_complete(task_id, result, artifacts).await?;
        self.after_terminal(&report.task).await?;
        Ok(report)
    }

    pub async fn fail(&self, task_id: &str, error: &str) -> Result<TransitionReport> {
        let report = self.queue.on_task_error(task_id, error).await?;
        self.after_terminal(&report.task).await?;
        Ok(report)
    }

    pub async fn cancel(&self, task_id: &str, reason: &str) -> Result<TransitionReport> {
        let report = self.queue.cancel_task(task_id, reason).await?;
        self.after_terminal(&report.task).await?;
        Ok(report)
    }

    /// Re-queues a failed task, bounded by its retry limit. A retried pool
    /// worker reopens its pool, and for pipeline steps the failed step, so
    /// the new result is merged and the pipeline can advance again.
    pub async fn retry(&self, task_id: &str) -> Result<Task> {
        let before = self.queue.get_task(task_id)?;
        if let Some(link) = &before.link {
            let parent = self.queue.get_task(&link.parent_task_id)?;
            if matches!(parent.status, TaskStatus::Completed | TaskStatus::Cancelled) {
                return Err(OrchestratorError::Validation(format!(
                    "Task {} belongs to {} container {}",
                    task_id, parent.status, parent.id
                )));
            }
        }

        let task = self.queue.start_task(task_id).await?;
        let requeued = before.status == TaskStatus::Failed && task.status == TaskStatus::Pending;
        if let (true, Some(link)) = (requeued, &task.link) {
            match &link.step_id {
                Some(step_id) => {
                    self.pipelines.reopen_step(&link.parent_task_id, step_id)?;
                }
                None => self.pools.reopen(&link.pool_id, "Worker retried")?,
            }
        }
        Ok(task)
    }

    /// Hands a terminal pool child to its pool and, for pipeline steps, to
    /// the pipeline runner.
    async fn after_terminal(&self, task: &Task) -> Result<()> {
        if !task.status.is_terminal() {
            return Ok(());
        }
        let Some(link) = &task.link else {
            return Ok(());
        };

        self.pools.on_worker_terminal(task).await?;
        if link.step_id.is_some() {
            self.pipelines.on_child_terminal(task).await?;
            return Ok(());
        }

        let pool = self.pools.get_pool(&link.pool_id)?;
        if pool.owns_parent
            && pool.merged.is_none()
            && self.pools.check_worker_pool_completion(&pool.pool_id)?.complete
        {
            self.pools.merge_worker_outputs(&pool.pool_id).await?;
        }
        Ok(())
    }

    // ===== Run loop =====

    /// One pass: timeouts, then progress polling, then a dispatch sweep.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        for task in self.queue.check_timeouts().await? {
            report.timed_out.push(task.id.clone());
            if let Err(e) = self.after_terminal(&task).await {
                tracing::warn!("Follow-up for timed out task {} failed: {}", task.id, e);
            }
        }

        for (task_id, outcome) in self.queue.poll_all_progress().await? {
            let terminal = match outcome {
                PollOutcome::Completed(r) => {
                    report.completed.push(task_id.clone());
                    r.task
                }
                PollOutcome::Failed(r) => {
                    report.failed.push(task_id.clone());
                    r.task
                }
                _ => continue,
            };
            if let Err(e) = self.after_terminal(&terminal).await {
                tracing::warn!("Follow-up for task {} failed: {}", task_id, e);
            }
        }

        let sweep = self.queue.process_queue().await?;
        report.dispatched = sweep.dispatched;
        report.spawn_failures = sweep.spawn_failures;
        report.abandoned = sweep.abandoned;
        for task_id in &report.spawn_failures {
            let task = self.queue.get_task(task_id)?;
            if let Err(e) = self.after_terminal(&task).await {
                tracing::warn!("Follow-up for task {} failed: {}", task_id, e);
            }
        }
        Ok(report)
    }

    /// Ticks every `processingIntervalMs` until `cancel` fires. The interval
    /// is re-read each pass so config updates apply without a restart.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Orchestrator run loop started");
        loop {
            if let Err(e) = self.tick().await {
                tracing::warn!("Orchestrator tick failed: {}", e);
                emit_event(
                    Level::WARN,
                    ObservabilityEvent::new("engine", "tick_failed").error_code(e.code()),
                );
            }
            let interval = self.queue.queue_config().await.processing_interval_ms;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
            }
        }
        tracing::info!("Orchestrator run loop stopped");
    }
}
