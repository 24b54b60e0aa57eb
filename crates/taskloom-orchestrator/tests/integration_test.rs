use async_trait::async_trait;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use taskloom_orchestrator::{
    MemoryProgressChannel, NewTask, Orchestrator, OrchestratorConfig, OrchestratorError,
    PipelineConfig, PipelineStep, ProgressChannel, ProgressSnapshot, SpawnAdapter, SpawnHandle,
    SpawnRequest, StepStatus, TaskStatus, TransitionOutcome,
};
use tempfile::TempDir;

#[derive(Default)]
struct CountingSpawner {
    launched: AtomicUsize,
}

#[async_trait]
impl SpawnAdapter for CountingSpawner {
    async fn spawn(&self, request: SpawnRequest) -> taskloom_orchestrator::Result<SpawnHandle> {
        let n = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SpawnHandle {
            worker_handle: format!("worker-{}", n),
            progress_channel_ref: request.progress_channel_ref,
            pid: None,
        })
    }
}

fn setup(temp: &TempDir) -> (Orchestrator, Arc<MemoryProgressChannel>) {
    let progress = Arc::new(MemoryProgressChannel::new());
    let orch = Orchestrator::with_adapters(
        OrchestratorConfig::rooted_at(temp.path()),
        Arc::new(CountingSpawner::default()),
        progress.clone(),
    )
    .unwrap();
    (orch, progress)
}

fn only_child(orch: &Orchestrator, pipeline_id: &str, step_id: &str) -> String {
    let run = orch.pipeline_status(pipeline_id).unwrap();
    let children = &run.step_agents[step_id];
    assert_eq!(children.len(), 1, "step {} should have one worker", step_id);
    children[0].clone()
}

fn diamond() -> PipelineConfig {
    PipelineConfig::new(vec![
        PipelineStep::new("a", "evaluator"),
        PipelineStep::new("b", "worker").depends_on(&["a"]),
        PipelineStep::new("c", "worker").depends_on(&["a"]),
        PipelineStep::new("d", "integrator").depends_on(&["b", "c"]),
    ])
}

#[tokio::test]
async fn test_diamond_pipeline_runs_in_dependency_order() {
    let temp = TempDir::new().unwrap();
    let (orch, progress) = setup(&temp);

    let parent = orch
        .create_pipeline_task("p1", "Diamond", "Fan out and join", diamond())
        .await
        .unwrap();
    let run = orch.pipeline_status(&parent.id).unwrap();
    assert_eq!(run.status_of("a"), Some(StepStatus::Running));
    for step in ["b", "c", "d"] {
        assert_eq!(run.status_of(step), Some(StepStatus::Pending));
    }

    orch.tick().await.unwrap();
    let a = only_child(&orch, &parent.id, "a");
    orch.complete(&a, Some("planned".into()), vec![]).await.unwrap();

    let run = orch.pipeline_status(&parent.id).unwrap();
    assert_eq!(run.status_of("a"), Some(StepStatus::Completed));
    assert_eq!(run.status_of("b"), Some(StepStatus::Running));
    assert_eq!(run.status_of("c"), Some(StepStatus::Running));
    assert_eq!(run.status_of("d"), Some(StepStatus::Pending));

    let tick = orch.tick().await.unwrap();
    assert_eq!(tick.dispatched.len(), 2);

    let b = only_child(&orch, &parent.id, "b");
    orch.complete(&b, Some("left".into()), vec![]).await.unwrap();
    let run = orch.pipeline_status(&parent.id).unwrap();
    assert_eq!(run.status_of("b"), Some(StepStatus::Completed));
    assert_eq!(run.status_of("d"), Some(StepStatus::Pending));

    let c = only_child(&orch, &parent.id, "c");
    orch.complete(&c, Some("right".into()), vec![]).await.unwrap();
    let run = orch.pipeline_status(&parent.id).unwrap();
    assert_eq!(run.status_of("d"), Some(StepStatus::Running));

    orch.tick().await.unwrap();
    let d = only_child(&orch, &parent.id, "d");
    progress
        .write(&d, &ProgressSnapshot::new(100, "joined").with_exit_code(0))
        .unwrap();
    let tick = orch.tick().await.unwrap();
    assert_eq!(tick.completed, vec![d.clone()]);

    let parent = orch.queue().get_task(&parent.id).unwrap();
    assert_eq!(parent.status, TaskStatus::Completed);
    assert!(parent.result.unwrap().contains("Pipeline completed: 4 steps"));
    assert!(orch.pipeline_status(&parent.id).unwrap().all_completed());
}

#[tokio::test]
async fn test_repeated_completion_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let (orch, _) = setup(&temp);
    let parent = orch
        .create_pipeline_task("p1", "Twice", "", diamond())
        .await
        .unwrap();
    orch.tick().await.unwrap();
    let a = only_child(&orch, &parent.id, "a");

    let first = orch.complete(&a, Some("once".into()), vec![]).await.unwrap();
    let second = orch.complete(&a, Some("twice".into()), vec![]).await.unwrap();

    assert_eq!(first.outcome, TransitionOutcome::Applied);
    assert_eq!(
        second.outcome,
        TransitionOutcome::AlreadyTerminal(TaskStatus::Completed)
    );
    let task = orch.queue().get_task(&a).unwrap();
    assert_eq!(task.result.as_deref(), Some("once"));
    assert_eq!(
        task.status_history
            .iter()
            .filter(|e| e.status == TaskStatus::Completed)
            .count(),
        1
    );

    let run = orch.pipeline_status(&parent.id).unwrap();
    assert_eq!(run.step_agents["b"].len(), 1);
    assert_eq!(run.step_agents["c"].len(), 1);
}

#[tokio::test]
async fn test_missing_artifact_is_recorded_not_fatal() {
    let temp = TempDir::new().unwrap();
    let (orch, _) = setup(&temp);
    let workdir = temp.path().join("workspaces/p1");
    fs::create_dir_all(&workdir).unwrap();
    fs::write(workdir.join("report.md"), "# Report").unwrap();

    let task = orch
        .submit(NewTask::new("p1", "Write report", "worker"))
        .await
        .unwrap();
    orch.tick().await.unwrap();

    let report = orch
        .complete(
            &task.id,
            Some("written".into()),
            vec!["report.md".into(), "out.txt".into()],
        )
        .await
        .unwrap();

    assert_eq!(report.task.status, TaskStatus::Completed);
    assert_eq!(report.accepted_artifacts, vec!["report.md".to_string()]);
    assert_eq!(report.missing_artifacts, vec!["out.txt".to_string()]);
}

#[tokio::test]
async fn test_cyclic_pipeline_is_rejected() {
    let temp = TempDir::new().unwrap();
    let (orch, _) = setup(&temp);
    let config = PipelineConfig::new(vec![
        PipelineStep::new("a", "worker").depends_on(&["c"]),
        PipelineStep::new("b", "worker").depends_on(&["a"]),
        PipelineStep::new("c", "worker").depends_on(&["b"]),
    ]);

    let result = orch.create_pipeline_task("p1", "Loop", "", config).await;

    match result {
        Err(OrchestratorError::MalformedPipelineGraph(_)) => (),
        other => panic!("Expected MalformedPipelineGraph, got {:?}", other),
    }
    assert!(orch.queue().list_tasks(None).unwrap().is_empty());
}
