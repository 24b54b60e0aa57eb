// Pipeline Runner
// Dependency-ordered steps, each fanned out through a worker pool

use crate::agents::AgentRegistry;
use crate::error::{OrchestratorError, Result};
use crate::pool::{PoolRequest, PoolStrategy, WorkerPoolManager, MAX_POOL_WORKERS};
use crate::queue::TaskQueue;
use crate::scheduler::{ready_nodes, validate_graph, GraphNode};
use crate::shared_context::{AgentMessage, AgentSlot, SharedContext};
use crate::store::{JsonCollection, Record};
use crate::types::{NewTask, QueueEvent, Task, TaskKind, TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskloom_observability::{emit_event, ObservabilityEvent};
use tracing::Level;

pub const MAX_PIPELINE_STEPS: usize = 32;

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Informational only; scheduling never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Evaluator,
    #[default]
    Worker,
    Integrator,
    Reviewer,
    Tester,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    pub agent_id: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub instructions: String,
    /// Expected artifact names; advisory
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub strategy: PoolStrategy,
}

fn default_count() -> u32 {
    1
}

impl PipelineStep {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Worker,
            agent_id: agent_id.into(),
            count: 1,
            depends_on: Vec::new(),
            instructions: String::new(),
            output_files: Vec::new(),
            strategy: PoolStrategy::Split,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn of_type(mut self, step_type: StepType) -> Self {
        self.step_type = step_type;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_output_files(mut self, files: &[&str]) -> Self {
        self.output_files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

impl GraphNode for PipelineStep {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.depends_on
    }
}

/// How a step whose workers partly failed is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailurePolicy {
    /// Any failed worker fails the step
    #[default]
    Strict,
    /// The step completes if at least one worker completed
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineConfig {
    pub steps: Vec<PipelineStep>,
    #[serde(default)]
    pub step_failure_policy: Option<StepFailurePolicy>,
}

impl PipelineConfig {
    pub fn new(steps: Vec<PipelineStep>) -> Self {
        Self {
            steps,
            step_failure_policy: None,
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads `.json` as JSON and anything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::IoError(format!(
                "Failed to read pipeline config {}: {}",
                path.display(),
                e
            ))
        })?;
        match path.extension().and_then(|v| v.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    /// evaluate → implement (fanned out) → integrate → review → test
    pub fn standard(worker_count: u32) -> Self {
        Self::new(vec![
            PipelineStep::new("evaluate", "evaluator")
                .named("Evaluate")
                .of_type(StepType::Evaluator)
                .with_instructions("Assess the request and write the plan other agents will follow.")
                .with_output_files(&["PLAN.md"]),
            PipelineStep::new("implement", "worker")
                .named("Implement")
                .with_count(worker_count)
                .depends_on(&["evaluate"])
                .with_instructions("Implement your part of the plan."),
            PipelineStep::new("integrate", "integrator")
                .named("Integrate")
                .of_type(StepType::Integrator)
                .depends_on(&["implement"])
                .with_instructions("Combine the implementation work into one consistent change."),
            PipelineStep::new("review", "reviewer")
                .named("Review")
                .of_type(StepType::Reviewer)
                .depends_on(&["integrate"])
                .with_instructions("Review the integrated change and record findings.")
                .with_output_files(&["REVIEW.md"]),
            PipelineStep::new("test", "tester")
                .named("Test")
                .of_type(StepType::Tester)
                .depends_on(&["review"])
                .with_instructions("Run and extend the tests for the change."),
        ])
    }

    /// Rejects the whole pipeline before anything is created or dispatched.
    pub fn validate(&self, agents: &AgentRegistry) -> Result<()> {
        validate_graph(&self.steps)?;
        if self.steps.len() > MAX_PIPELINE_STEPS {
            return Err(OrchestratorError::Validation(format!(
                "Pipeline has {} steps; the limit is {}",
                self.steps.len(),
                MAX_PIPELINE_STEPS
            )));
        }
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(OrchestratorError::Validation(
                    "Step id must not be empty".to_string(),
                ));
            }
            if step.count == 0 || step.count > MAX_POOL_WORKERS {
                return Err(OrchestratorError::Validation(format!(
                    "Step '{}' count must be between 1 and {}, got {}",
                    step.id, MAX_POOL_WORKERS, step.count
                )));
            }
            agents.resolve(&step.agent_id)?;
        }
        Ok(())
    }
}

// ============================================================================
// Pipeline Run
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    /// Same as the parent task id
    pub pipeline_id: String,
    pub project_id: String,
    pub title: String,
    pub steps: Vec<PipelineStep>,
    pub step_status: BTreeMap<String, StepStatus>,
    /// Child task ids per step
    #[serde(default)]
    pub step_agents: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub step_pools: BTreeMap<String, String>,
    pub failure_policy: StepFailurePolicy,
    pub shared_context: SharedContext,
    pub shared_context_file: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for PipelineRun {
    fn record_id(&self) -> &str {
        &self.pipeline_id
    }
}

impl PipelineRun {
    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.step_status.get(step_id).copied()
    }

    pub fn all_completed(&self) -> bool {
        self.step_status.values().all(|s| *s == StepStatus::Completed)
    }

    pub fn step(&self, step_id: &str) -> Result<&PipelineStep> {
        self.steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("Step not found: {}", step_id)))
    }
}

// ============================================================================
// Pipeline Runner
// ============================================================================

pub struct PipelineRunner {
    queue: Arc<TaskQueue>,
    pools: Arc<WorkerPoolManager>,
    runs: JsonCollection<PipelineRun>,
    default_policy: StepFailurePolicy,
}

impl PipelineRunner {
    pub fn new(
        queue: Arc<TaskQueue>,
        pools: Arc<WorkerPoolManager>,
        data_dir: &Path,
        default_policy: StepFailurePolicy,
    ) -> Result<Self> {
        Ok(Self {
            queue,
            pools,
            runs: JsonCollection::open(data_dir.join("pipelines.json"))?,
            default_policy,
        })
    }

    pub fn pipeline_status(&self, pipeline_id: &str) -> Result<PipelineRun> {
        self.runs
            .get(pipeline_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("Pipeline not found: {}", pipeline_id)))
    }

    pub fn list_pipelines(&self, project_id: Option<&str>) -> Result<Vec<PipelineRun>> {
        Ok(self
            .runs
            .load_all()?
            .into_iter()
            .filter(|r| project_id.map_or(true, |p| r.project_id == p))
            .collect())
    }

    /// Validates the graph, records the parent task and run, and dispatches
    /// the root steps.
    pub async fn create_pipeline_task(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        config: PipelineConfig,
    ) -> Result<Task> {
        config.validate(self.queue.agents())?;

        let mut draft = NewTask::new(project_id, title, "pipeline").with_description(description);
        draft.kind = TaskKind::Pipeline;
        draft.priority = TaskPriority::Medium;
        let parent = self.queue.create_task(draft).await?;

        let shared_context_file = self
            .queue
            .project_dir(project_id)
            .join(".taskloom")
            .join("pipelines")
            .join(&parent.id)
            .join("SHARED_CONTEXT.md");
        let now = Utc::now();
        let run = PipelineRun {
            pipeline_id: parent.id.clone(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            step_status: config
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepStatus::Pending))
                .collect(),
            step_agents: BTreeMap::new(),
            step_pools: BTreeMap::new(),
            failure_policy: config.step_failure_policy.unwrap_or(self.default_policy),
            shared_context: SharedContext::new(&parent.id, &config.steps),
            steps: config.steps,
            shared_context_file,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.open_run(run).await {
            tracing::warn!("Pipeline {} could not be started: {}", parent.id, e);
            self.queue
                .cancel_task(&parent.id, "Pipeline could not be started")
                .await?;
            return Err(e);
        }

        tracing::info!("Created pipeline {} ({}) for project {}", parent.id, title, project_id);
        self.queue.get_task(&parent.id)
    }

    async fn open_run(&self, run: PipelineRun) -> Result<()> {
        run.shared_context.write_to(&run.shared_context_file, &run.title)?;
        let pipeline_id = run.pipeline_id.clone();
        self.runs.insert(run)?;
        self.start_pipeline(&pipeline_id).await?;
        Ok(())
    }

    /// Starts the parent container and dispatches every step whose
    /// dependencies are met. Returns the dispatched step ids.
    pub async fn start_pipeline(&self, pipeline_id: &str) -> Result<Vec<String>> {
        self.queue.start_container(pipeline_id)?;
        self.advance(pipeline_id).await
    }

    /// Claims ready steps (`pending → running`, checked and set under the
    /// store lock) and fans each out through a worker pool.
    async fn advance(&self, pipeline_id: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let (run, claimed) = self.runs.update(pipeline_id, |run| {
            let ready: Vec<String> = ready_nodes(
                &run.steps,
                |id| run.step_status.get(id) == Some(&StepStatus::Completed),
                |id| run.step_status.get(id) == Some(&StepStatus::Pending),
            )
            .into_iter()
            .map(|s| s.id.clone())
            .collect();
            for step_id in &ready {
                run.step_status.insert(step_id.clone(), StepStatus::Running);
                run.shared_context.set_step_status(step_id, StepStatus::Running)?;
            }
            if !ready.is_empty() {
                run.updated_at = now;
            }
            Ok((run.clone(), ready))
        })?;

        for step_id in &claimed {
            self.announce_step(&run, step_id, StepStatus::Running);
            let step = run.step(step_id)?;
            if let Err(e) = self.dispatch_step(&run, step).await {
                tracing::warn!("Failed to dispatch step {} of pipeline {}: {}", step_id, pipeline_id, e);
                emit_event(
                    Level::WARN,
                    ObservabilityEvent::new("pipeline", "step_dispatch_failed")
                        .task(pipeline_id)
                        .pipeline(pipeline_id)
                        .project(&run.project_id)
                        .step(step_id)
                        .error_code(e.code()),
                );
                self.settle_step(pipeline_id, step_id, StepStatus::Failed, Some(e.to_string()))?;
            }
        }
        if !claimed.is_empty() {
            self.refresh_shared_context(pipeline_id)?;
        }
        Ok(claimed)
    }

    async fn dispatch_step(&self, run: &PipelineRun, step: &PipelineStep) -> Result<()> {
        let mut instructions = step.instructions.trim().to_string();
        if !step.output_files.is_empty() {
            instructions.push_str(&format!(
                "\n\nExpected outputs: {}",
                step.output_files.join(", ")
            ));
        }
        let mut request = PoolRequest::new(
            &run.pipeline_id,
            &run.project_id,
            &step.agent_id,
            step.count,
            step.strategy,
        );
        request.title = format!("{}: {}", run.title, step.display_name());
        request.instructions = instructions;
        request.step_id = Some(step.id.clone());
        request.shared_context_file = Some(run.shared_context_file.clone());

        let pool = self.pools.create_worker_pool(request).await?;
        let pool_id = pool.pool_id.clone();
        let children = pool.child_task_ids.clone();
        self.runs.update(&run.pipeline_id, |r| {
            r.step_pools.insert(step.id.clone(), pool_id);
            r.step_agents.insert(step.id.clone(), children);
            Ok(())
        })?;
        tracing::info!(
            "Pipeline {} dispatched step {} with {} worker(s)",
            run.pipeline_id,
            step.id,
            step.count
        );
        Ok(())
    }

    /// Settles `step_id` if all of its workers are terminal, then dispatches
    /// any step that became ready. Safe to call repeatedly; returns whether
    /// anything advanced.
    pub async fn check_step_completion(
        &self,
        project_id: &str,
        pipeline_id: &str,
        step_id: &str,
    ) -> Result<bool> {
        let run = self.pipeline_status(pipeline_id)?;
        if run.project_id != project_id {
            return Err(OrchestratorError::Validation(format!(
                "Pipeline {} does not belong to project {}",
                pipeline_id, project_id
            )));
        }
        run.step(step_id)?;

        let mut advanced = false;
        if run.status_of(step_id) == Some(StepStatus::Running) {
            if let Some(pool_id) = run.step_pools.get(step_id) {
                let pool = self.pools.get_pool(pool_id)?;
                self.runs.update(pipeline_id, |r| {
                    r.step_agents
                        .insert(step_id.to_string(), pool.child_task_ids.clone());
                    Ok(())
                })?;

                let completion = self.pools.check_worker_pool_completion(pool_id)?;
                if completion.complete {
                    let passed = match run.failure_policy {
                        StepFailurePolicy::Strict => completion.failed_workers == 0,
                        StepFailurePolicy::Lenient => completion.completed_workers > 0,
                    };
                    let merged = self.pools.merge_worker_outputs(pool_id).await?;
                    let status = if passed {
                        StepStatus::Completed
                    } else {
                        StepStatus::Failed
                    };
                    advanced |= self.settle_step(pipeline_id, step_id, status, Some(merged.result))?;
                    self.runs.update(pipeline_id, |r| {
                        for artifact in &merged.artifacts {
                            r.shared_context.add_output(step_id, artifact)?;
                        }
                        Ok(())
                    })?;
                }
            }
        }

        let dispatched = self.advance(pipeline_id).await?;
        advanced |= !dispatched.is_empty();
        self.finish_if_done(pipeline_id).await?;
        self.refresh_shared_context(pipeline_id)?;
        Ok(advanced)
    }

    /// Routes a terminal child back to its step. Tasks outside any pipeline
    /// are ignored.
    pub async fn on_child_terminal(&self, child: &Task) -> Result<bool> {
        let Some(link) = &child.link else {
            return Ok(false);
        };
        let Some(step_id) = &link.step_id else {
            return Ok(false);
        };
        self.check_step_completion(&child.project_id, &link.parent_task_id, step_id)
            .await
    }

    /// `running → completed|failed` exactly once.
    fn settle_step(
        &self,
        pipeline_id: &str,
        step_id: &str,
        status: StepStatus,
        summary: Option<String>,
    ) -> Result<bool> {
        let now = Utc::now();
        let (run, changed) = self.runs.update(pipeline_id, |run| {
            if run.status_of(step_id) != Some(StepStatus::Running) {
                return Ok((run.clone(), false));
            }
            run.step_status.insert(step_id.to_string(), status);
            run.shared_context.set_step_status(step_id, status)?;
            run.shared_context.step_mut(step_id)?.summary = summary;
            run.updated_at = now;
            Ok((run.clone(), true))
        })?;
        if changed {
            self.announce_step(&run, step_id, status);
            if status == StepStatus::Failed {
                tracing::warn!(
                    "Step {} of pipeline {} failed; dependents will not run",
                    step_id,
                    pipeline_id
                );
            }
        }
        Ok(changed)
    }

    /// `failed → running` for a step whose worker was re-queued. The step's
    /// pool drops its merge so the step settles again once that worker
    /// finishes. Returns false when the step was not failed or the pipeline
    /// already finished.
    pub fn reopen_step(&self, pipeline_id: &str, step_id: &str) -> Result<bool> {
        let parent = self.queue.get_task(pipeline_id)?;
        if matches!(parent.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            return Ok(false);
        }
        let now = Utc::now();
        let (run, reopened) = self.runs.update(pipeline_id, |run| {
            run.step(step_id)?;
            if run.status_of(step_id) != Some(StepStatus::Failed) {
                return Ok((run.clone(), false));
            }
            run.step_status.insert(step_id.to_string(), StepStatus::Running);
            run.shared_context.set_step_status(step_id, StepStatus::Running)?;
            run.shared_context.step_mut(step_id)?.summary = None;
            run.updated_at = now;
            Ok((run.clone(), true))
        })?;
        if !reopened {
            return Ok(false);
        }

        let reason = format!("Step {} retried", step_id);
        self.queue.reopen_container(pipeline_id, &reason)?;
        if let Some(pool_id) = run.step_pools.get(step_id) {
            self.pools.reopen(pool_id, &reason)?;
        }
        tracing::info!("Step {} of pipeline {} reopened", step_id, pipeline_id);
        self.announce_step(&run, step_id, StepStatus::Running);
        self.refresh_shared_context(pipeline_id)?;
        Ok(true)
    }

    async fn finish_if_done(&self, pipeline_id: &str) -> Result<()> {
        let run = self.pipeline_status(pipeline_id)?;
        if !run.all_completed() {
            return Ok(());
        }
        let parent = self.queue.get_task(pipeline_id)?;
        if parent.status.is_terminal() {
            return Ok(());
        }

        let mut summary = format!("Pipeline completed: {} steps", run.steps.len());
        let mut artifacts = Vec::new();
        for step in &run.shared_context.steps {
            summary.push_str(&format!("\n- {}: {}", step.name, step.status.as_str()));
            for output in &step.outputs {
                if !artifacts.contains(output) {
                    artifacts.push(output.clone());
                }
            }
        }
        self.queue
            .on_task_complete(pipeline_id, Some(summary), artifacts)
            .await?;
        tracing::info!("Pipeline {} completed", pipeline_id);
        Ok(())
    }

    // ===== Shared context =====

    pub fn post_message(&self, pipeline_id: &str, message: AgentMessage) -> Result<()> {
        self.runs.update(pipeline_id, |run| {
            if let Some(step_id) = &message.step_id {
                run.step(step_id)?;
            }
            run.shared_context.messages.push(message);
            Ok(())
        })?;
        self.refresh_shared_context(pipeline_id)
    }

    pub fn record_step_output(&self, pipeline_id: &str, step_id: &str, output: &str) -> Result<()> {
        self.runs.update(pipeline_id, |run| {
            run.shared_context.add_output(step_id, output)
        })?;
        self.refresh_shared_context(pipeline_id)
    }

    /// Syncs worker slots from the task table and rewrites the status block.
    fn refresh_shared_context(&self, pipeline_id: &str) -> Result<()> {
        let snapshot = self.pipeline_status(pipeline_id)?;
        let mut slots: BTreeMap<String, Vec<AgentSlot>> = BTreeMap::new();
        for (step_id, task_ids) in &snapshot.step_agents {
            let mut step_slots = Vec::with_capacity(task_ids.len());
            for task_id in task_ids {
                let task = self.queue.get_task(task_id)?;
                step_slots.push(AgentSlot {
                    agent_id: task.agent_id,
                    task_id: task.id,
                    status: task.status,
                    progress: task.progress,
                });
            }
            slots.insert(step_id.clone(), step_slots);
        }

        let run = self.runs.update(pipeline_id, |run| {
            for (step_id, step_slots) in slots {
                run.shared_context.step_mut(&step_id)?.agents = step_slots;
            }
            Ok(run.clone())
        })?;
        run.shared_context.write_to(&run.shared_context_file, &run.title)
    }

    fn announce_step(&self, run: &PipelineRun, step_id: &str, status: StepStatus) {
        emit_event(
            Level::INFO,
            ObservabilityEvent::new("pipeline", "step_status_changed")
                .task(&run.pipeline_id)
                .pipeline(&run.pipeline_id)
                .project(&run.project_id)
                .step(step_id)
                .status(status.as_str()),
        );
        self.queue.publish(QueueEvent::StepStatusChanged {
            pipeline_id: run.pipeline_id.clone(),
            step_id: step_id.to_string(),
            status: status.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }
}
