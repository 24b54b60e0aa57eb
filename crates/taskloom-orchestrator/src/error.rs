// Orchestrator Error Types
use crate::scheduler::GraphError;
use crate::types::TaskStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task_id} exhausted its retries ({retry_count}/{max_retries})")]
    RetryLimitExceeded {
        task_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Spawn failure: {0}")]
    SpawnFailure(String),

    #[error("Malformed pipeline graph: {0}")]
    MalformedPipelineGraph(#[from] GraphError),

    #[error("Worker pool incomplete: {0}")]
    WorkerPoolIncomplete(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OrchestratorError {
    /// Short machine-readable code used in observability events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::IoError(_) => "io",
            Self::Serialization(_) | Self::Yaml(_) | Self::ParseError(_) => "parse",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::RetryLimitExceeded { .. } => "retry_limit",
            Self::SpawnFailure(_) => "spawn_failure",
            Self::MalformedPipelineGraph(_) => "malformed_graph",
            Self::WorkerPoolIncomplete(_) => "pool_incomplete",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
