// Orchestrator Configuration
// Tunables for the queue, worker launching, and storage locations

use crate::agents::AgentProfile;
use crate::error::{OrchestratorError, Result};
use crate::pipeline::StepFailurePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use taskloom_observability::LogSettings;

// ============================================================================
// Queue Configuration
// ============================================================================

/// Scheduler tunables. Changes apply on the next sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Ceiling on tasks holding a worker slot at once
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_processing_interval_ms")]
    pub processing_interval_ms: u64,
    /// Quiet time after which a processing task is reported as stuck
    #[serde(default = "default_stuck_threshold_minutes")]
    pub stuck_threshold_minutes: u32,
}

fn default_max_concurrent_tasks() -> u32 {
    3
}

fn default_timeout_minutes() -> u32 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_processing_interval_ms() -> u64 {
    5_000
}

fn default_stuck_threshold_minutes() -> u32 {
    20
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_timeout_minutes: default_timeout_minutes(),
            max_retries: default_max_retries(),
            processing_interval_ms: default_processing_interval_ms(),
            stuck_threshold_minutes: default_stuck_threshold_minutes(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "maxConcurrentTasks must be at least 1".to_string(),
            ));
        }
        if self.default_timeout_minutes == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "defaultTimeoutMinutes must be at least 1".to_string(),
            ));
        }
        if self.processing_interval_ms == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "processingIntervalMs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies `TASKLOOM_*` overrides. Unparseable values are ignored with a
    /// warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_number("TASKLOOM_MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks = v;
        }
        if let Some(v) = env_number("TASKLOOM_DEFAULT_TIMEOUT_MINUTES") {
            self.default_timeout_minutes = v;
        }
        if let Some(v) = env_number("TASKLOOM_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(v) = env_number("TASKLOOM_PROCESSING_INTERVAL_MS") {
            self.processing_interval_ms = v;
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

// ============================================================================
// Process Spawning
// ============================================================================

/// Default command used by the process spawn adapter when an agent profile
/// does not carry its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpawnConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Extra arguments; `{agent}` and `{instructions_file}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_program() -> String {
    "taskloom-worker".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "--agent".to_string(),
        "{agent}".to_string(),
        "--instructions".to_string(),
        "{instructions_file}".to_string(),
    ]
}

impl Default for ProcessSpawnConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
        }
    }
}

// ============================================================================
// Orchestrator Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    /// Where tasks.json, pools.json, pipelines.json and progress files live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Project working directories default to `<workspaceRoot>/<projectId>`
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub step_failure_policy: StepFailurePolicy,
    #[serde(default)]
    pub process: ProcessSpawnConfig,
    #[serde(default)]
    pub logging: LogSettings,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".taskloom")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("workspaces")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            data_dir: default_data_dir(),
            workspace_root: default_workspace_root(),
            agents: Vec::new(),
            step_failure_policy: StepFailurePolicy::default(),
            process: ProcessSpawnConfig::default(),
            logging: LogSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Config rooted at `root`: data under `root/.taskloom`, projects under
    /// `root/workspaces`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join(".taskloom"),
            workspace_root: root.join("workspaces"),
            ..Self::default()
        }
    }

    /// Reads a JSON config file, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::IoError(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| OrchestratorError::ParseError(format!("Failed to parse config: {}", e)))?;
        config.queue.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        if self.process.program.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "process.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.data_dir.join("progress")
    }

    pub fn instructions_dir(&self) -> PathBuf {
        self.data_dir.join("instructions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(taskloom_observability::LOGS_DIR_NAME)
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.workspace_root.join(project_id)
    }
}
