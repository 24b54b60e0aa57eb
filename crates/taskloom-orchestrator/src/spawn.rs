// Worker Spawning
// The boundary between the scheduler and whatever actually runs a worker

use crate::agents::AgentProfile;
use crate::config::ProcessSpawnConfig;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use taskloom_observability::redact_text;
use tokio::process::Command;

/// Everything needed to launch one worker attempt.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: String,
    pub agent: AgentProfile,
    pub instructions: String,
    pub working_directory: PathBuf,
    pub timeout_minutes: u32,
    pub progress_channel_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnHandle {
    /// Identifier of the launched instance, recorded as the task's assigned worker
    pub worker_handle: String,
    pub progress_channel_ref: String,
    pub pid: Option<u32>,
}

/// Launches workers. Implementations return once the worker is running and
/// report launch failures as errors, never as later progress.
#[async_trait]
pub trait SpawnAdapter: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnHandle>;
}

// ============================================================================
// Process Adapter
// ============================================================================

/// Launches each worker as a local child process.
pub struct ProcessSpawnAdapter {
    config: ProcessSpawnConfig,
    instructions_dir: PathBuf,
}

impl ProcessSpawnAdapter {
    pub fn new(config: ProcessSpawnConfig, instructions_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            instructions_dir: instructions_dir.into(),
        }
    }

    fn command_line(&self, agent: &AgentProfile, instructions_file: &Path, task_id: &str) -> Vec<String> {
        let template: Vec<String> = match agent.command.as_ref().filter(|c| !c.is_empty()) {
            Some(command) => command.clone(),
            None => std::iter::once(self.config.program.clone())
                .chain(self.config.args.iter().cloned())
                .collect(),
        };
        let file = instructions_file.display().to_string();
        template
            .into_iter()
            .map(|part| {
                part.replace("{agent}", &agent.id)
                    .replace("{instructions_file}", &file)
                    .replace("{task_id}", task_id)
            })
            .collect()
    }

    async fn write_instructions(&self, task_id: &str, instructions: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.instructions_dir)
            .await
            .map_err(|e| {
                OrchestratorError::SpawnFailure(format!(
                    "Failed to create instructions directory: {}",
                    e
                ))
            })?;
        let path = self.instructions_dir.join(format!("{}.md", task_id));
        tokio::fs::write(&path, instructions).await.map_err(|e| {
            OrchestratorError::SpawnFailure(format!("Failed to write instructions: {}", e))
        })?;
        Ok(path)
    }
}

#[async_trait]
impl SpawnAdapter for ProcessSpawnAdapter {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnHandle> {
        let instructions_file = self
            .write_instructions(&request.task_id, &request.instructions)
            .await?;
        let argv = self.command_line(&request.agent, &instructions_file, &request.task_id);
        let (program, args) = argv.split_first().ok_or_else(|| {
            OrchestratorError::SpawnFailure(format!("Agent {} has an empty command", request.agent.id))
        })?;

        tokio::fs::create_dir_all(&request.working_directory)
            .await
            .map_err(|e| {
                OrchestratorError::SpawnFailure(format!(
                    "Failed to prepare working directory {}: {}",
                    request.working_directory.display(),
                    e
                ))
            })?;

        tracing::debug!(
            "Spawning {} for task {} with instructions {}",
            program,
            request.task_id,
            redact_text(&request.instructions)
        );

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&request.working_directory)
            .env("TASKLOOM_TASK_ID", &request.task_id)
            .env("TASKLOOM_PROGRESS_FILE", &request.progress_channel_ref)
            .env("TASKLOOM_TIMEOUT_MINUTES", request.timeout_minutes.to_string())
            .env("TASKLOOM_INSTRUCTIONS_FILE", &instructions_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|e| {
            OrchestratorError::SpawnFailure(format!("Failed to launch {}: {}", program, e))
        })?;
        let pid = child.id();

        let task_id = request.task_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!("Worker for task {} exited: {}", task_id, status)
                }
                Ok(status) => tracing::warn!("Worker for task {} exited: {}", task_id, status),
                Err(e) => tracing::warn!("Failed to reap worker for task {}: {}", task_id, e),
            }
        });

        let worker_handle = match pid {
            Some(pid) => format!("pid:{}", pid),
            None => format!("proc:{}", request.task_id),
        };
        Ok(SpawnHandle {
            worker_handle,
            progress_channel_ref: request.progress_channel_ref,
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, agent: AgentProfile) -> SpawnRequest {
        SpawnRequest {
            task_id: "t1".to_string(),
            agent,
            instructions: "do the thing".to_string(),
            working_directory: dir.join("work"),
            timeout_minutes: 5,
            progress_channel_ref: dir.join("t1.json").display().to_string(),
        }
    }

    #[test]
    fn command_line_substitutes_placeholders() {
        let adapter = ProcessSpawnAdapter::new(ProcessSpawnConfig::default(), "/data/instructions");
        let agent = AgentProfile::new("tester", "");

        let argv = adapter.command_line(&agent, Path::new("/data/instructions/t1.md"), "t1");

        assert_eq!(
            argv,
            vec![
                "taskloom-worker",
                "--agent",
                "tester",
                "--instructions",
                "/data/instructions/t1.md"
            ]
        );
    }

    #[test]
    fn agent_command_overrides_default() {
        let adapter = ProcessSpawnAdapter::new(ProcessSpawnConfig::default(), "/x");
        let mut agent = AgentProfile::new("custom", "");
        agent.command = Some(vec!["runner".to_string(), "{task_id}".to_string()]);

        let argv = adapter.command_line(&agent, Path::new("/x/t9.md"), "t9");
        assert_eq!(argv, vec!["runner", "t9"]);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let temp = tempfile::tempdir().unwrap();
        let config = ProcessSpawnConfig {
            program: "taskloom-definitely-missing-binary".to_string(),
            args: Vec::new(),
        };
        let adapter = ProcessSpawnAdapter::new(config, temp.path().join("instructions"));

        let result = adapter
            .spawn(request(temp.path(), AgentProfile::new("worker", "")))
            .await;

        assert!(matches!(result, Err(OrchestratorError::SpawnFailure(_))));
        let written = std::fs::read_to_string(temp.path().join("instructions/t1.md")).unwrap();
        assert_eq!(written, "do the thing");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launches_a_real_process_with_prepared_files() {
        let temp = tempfile::tempdir().unwrap();
        let adapter =
            ProcessSpawnAdapter::new(ProcessSpawnConfig::default(), temp.path().join("instructions"));
        let mut agent = AgentProfile::new("shell", "");
        agent.command = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "test -f \"$TASKLOOM_INSTRUCTIONS_FILE\"".to_string(),
        ]);

        let handle = adapter.spawn(request(temp.path(), agent)).await.unwrap();

        assert!(handle.pid.is_some());
        assert!(handle.worker_handle.starts_with("pid:"));
        assert_eq!(
            handle.progress_channel_ref,
            temp.path().join("t1.json").display().to_string()
        );
        assert!(temp.path().join("work").is_dir());
        let written = std::fs::read_to_string(temp.path().join("instructions/t1.md")).unwrap();
        assert_eq!(written, "do the thing");
    }
}
