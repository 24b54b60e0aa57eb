use crate::agents::AgentRegistry;
use crate::config::QueueConfig;
use crate::error::{OrchestratorError, Result};
use crate::progress::MemoryProgressChannel;
use crate::queue::TaskQueue;
use crate::spawn::{SpawnAdapter, SpawnHandle, SpawnRequest};
use crate::store::TaskStore;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Records every launch instead of starting a process.
#[derive(Default)]
pub(crate) struct ScriptedSpawner {
    launched: Mutex<Vec<SpawnRequest>>,
    failing_agents: Mutex<HashSet<String>>,
}

impl ScriptedSpawner {
    pub(crate) fn fail_agent(&self, agent_id: &str) {
        self.failing_agents
            .lock()
            .unwrap()
            .insert(agent_id.to_string());
    }

    pub(crate) fn launched(&self) -> Vec<SpawnRequest> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpawnAdapter for ScriptedSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnHandle> {
        if self.failing_agents.lock().unwrap().contains(&request.agent.id) {
            return Err(OrchestratorError::SpawnFailure(format!(
                "scripted failure for {}",
                request.agent.id
            )));
        }
        let mut launched = self.launched.lock().unwrap();
        launched.push(request.clone());
        Ok(SpawnHandle {
            worker_handle: format!("fake-{}", launched.len()),
            progress_channel_ref: request.progress_channel_ref,
            pid: None,
        })
    }
}

pub(crate) struct QueueHarness {
    pub(crate) temp: TempDir,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) spawner: Arc<ScriptedSpawner>,
    pub(crate) progress: Arc<MemoryProgressChannel>,
}

pub(crate) fn queue_harness(max_concurrent_tasks: u32) -> QueueHarness {
    let temp = tempfile::tempdir().unwrap();
    let spawner = Arc::new(ScriptedSpawner::default());
    let progress = Arc::new(MemoryProgressChannel::new());
    let queue = build_queue(&temp, max_concurrent_tasks, spawner.clone(), progress.clone());
    QueueHarness {
        temp,
        queue,
        spawner,
        progress,
    }
}

/// Queue over `temp/data` and `temp/workspaces` with the given spawner.
pub(crate) fn build_queue(
    temp: &TempDir,
    max_concurrent_tasks: u32,
    spawner: Arc<dyn SpawnAdapter>,
    progress: Arc<MemoryProgressChannel>,
) -> Arc<TaskQueue> {
    let store = Arc::new(TaskStore::new(&temp.path().join("data")).unwrap());
    let config = QueueConfig {
        max_concurrent_tasks,
        ..QueueConfig::default()
    };
    Arc::new(TaskQueue::new(
        store,
        spawner,
        progress,
        Arc::new(AgentRegistry::default()),
        config,
        temp.path().join("workspaces"),
    ))
}
