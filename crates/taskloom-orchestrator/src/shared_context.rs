//! Coordination document shared by every worker in one pipeline run.
//!
//! The structured copy lives with the pipeline run; a markdown rendering is
//! written into the project workspace for workers to read. The orchestrator
//! only ever rewrites the block between the status markers, so notes agents
//! add below it survive every refresh.

use crate::error::{OrchestratorError, Result};
use crate::pipeline::{PipelineStep, StepStatus};
use crate::store::atomic_write;
use crate::types::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const STATUS_BEGIN: &str = "<!-- taskloom:status:begin -->";
pub const STATUS_END: &str = "<!-- taskloom:status:end -->";
const NOTES_HEADING: &str = "## Agent Notes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentSlot {
    pub agent_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SharedStepContext {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub agents: Vec<AgentSlot>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentMessage {
    pub from: String,
    /// Recipient agent id, or `all`
    pub to: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub step_id: Option<String>,
}

impl AgentMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message: message.into(),
            timestamp: Utc::now(),
            step_id: None,
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SharedContext {
    pub pipeline_id: String,
    pub task_id: String,
    pub current_step_index: usize,
    pub steps: Vec<SharedStepContext>,
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
}

impl SharedContext {
    pub fn new(pipeline_id: &str, steps: &[PipelineStep]) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            task_id: pipeline_id.to_string(),
            current_step_index: 0,
            steps: steps
                .iter()
                .map(|step| SharedStepContext {
                    step_id: step.id.clone(),
                    name: step.name.clone(),
                    status: StepStatus::Pending,
                    agents: Vec::new(),
                    outputs: Vec::new(),
                    summary: None,
                })
                .collect(),
            messages: Vec::new(),
        }
    }

    pub fn step_mut(&mut self, step_id: &str) -> Result<&mut SharedStepContext> {
        self.steps
            .iter_mut()
            .find(|s| s.step_id == step_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("Step not found: {}", step_id)))
    }

    pub fn set_step_status(&mut self, step_id: &str, status: StepStatus) -> Result<()> {
        self.step_mut(step_id)?.status = status;
        self.current_step_index = self
            .steps
            .iter()
            .position(|s| matches!(s.status, StepStatus::Pending | StepStatus::Running))
            .unwrap_or(self.steps.len());
        Ok(())
    }

    /// Appends an output path, ignoring repeats.
    pub fn add_output(&mut self, step_id: &str, output: &str) -> Result<()> {
        let step = self.step_mut(step_id)?;
        if !step.outputs.iter().any(|o| o == output) {
            step.outputs.push(output.to_string());
        }
        Ok(())
    }

    pub fn render_status_block(&self, title: &str) -> String {
        let mut out = String::new();
        out.push_str(STATUS_BEGIN);
        out.push('\n');
        out.push_str(&format!("# Shared Context: {}\n\n", title));
        out.push_str(&format!("- Pipeline: `{}`\n", self.pipeline_id));
        match self.steps.get(self.current_step_index) {
            Some(step) => out.push_str(&format!("- Current step: {} (`{}`)\n", step.name, step.step_id)),
            None => out.push_str("- Current step: none (all steps settled)\n"),
        }
        out.push('\n');

        out.push_str("## Steps\n\n");
        for step in &self.steps {
            out.push_str(&format!(
                "### {} (`{}`): {}\n",
                step.name,
                step.step_id,
                step.status.as_str()
            ));
            for agent in &step.agents {
                out.push_str(&format!(
                    "- {} `{}`: {} ({}%)\n",
                    agent.agent_id, agent.task_id, agent.status, agent.progress
                ));
            }
            if !step.outputs.is_empty() {
                out.push_str(&format!("- Outputs: {}\n", step.outputs.join(", ")));
            }
            if let Some(summary) = &step.summary {
                out.push_str(&format!("\n{}\n", summary.trim()));
            }
            out.push('\n');
        }

        if !self.messages.is_empty() {
            out.push_str("## Messages\n\n");
            for msg in &self.messages {
                let step = msg
                    .step_id
                    .as_deref()
                    .map(|s| format!(" [{}]", s))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "- {} {} -> {}{}: {}\n",
                    msg.timestamp.to_rfc3339(),
                    msg.from,
                    msg.to,
                    step,
                    msg.message
                ));
            }
            out.push('\n');
        }
        out.push_str(STATUS_END);
        out.push('\n');
        out
    }

    /// Rewrites the status block at `path`, keeping everything else.
    pub fn write_to(&self, path: &Path, title: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OrchestratorError::IoError(format!("Failed to create shared context directory: {}", e))
            })?;
        }
        let existing = match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(OrchestratorError::IoError(format!(
                    "Failed to read shared context: {}",
                    err
                )))
            }
        };
        let block = self.render_status_block(title);
        let content = match existing {
            Some(existing) => splice_status_block(&existing, &block),
            None => format!(
                "{}\n{}\n\nAppend notes for other agents below. Do not edit the status block above.\n",
                block, NOTES_HEADING
            ),
        };
        atomic_write(path, &content)
    }
}

/// Replaces the marker-delimited block in `existing`. Without markers the
/// block is prepended and the old text is kept after it.
pub fn splice_status_block(existing: &str, block: &str) -> String {
    if let (Some(start), Some(end)) = (existing.find(STATUS_BEGIN), existing.find(STATUS_END)) {
        if start < end {
            let mut tail = &existing[end + STATUS_END.len()..];
            if let Some(stripped) = tail.strip_prefix('\n') {
                tail = stripped;
            }
            return format!("{}{}{}", &existing[..start], block, tail);
        }
    }
    format!("{}\n{}", block, existing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<PipelineStep> {
        vec![
            PipelineStep::new("plan", "evaluator"),
            PipelineStep::new("build", "worker").depends_on(&["plan"]),
        ]
    }

    #[test]
    fn status_block_reflects_steps_and_messages() {
        let mut ctx = SharedContext::new("pipe-1", &steps());
        ctx.set_step_status("plan", StepStatus::Completed).unwrap();
        ctx.add_output("plan", "PLAN.md").unwrap();
        ctx.add_output("plan", "PLAN.md").unwrap();
        ctx.messages
            .push(AgentMessage::new("evaluator", "all", "watch the parser").for_step("plan"));

        let block = ctx.render_status_block("Ship it");

        assert_eq!(ctx.current_step_index, 1);
        assert!(block.starts_with(STATUS_BEGIN));
        assert!(block.contains("- Current step: build (`build`)"));
        assert!(block.contains("### plan (`plan`): completed"));
        assert!(block.contains("- Outputs: PLAN.md\n"));
        assert!(block.contains("evaluator -> all [plan]: watch the parser"));
    }

    #[test]
    fn refresh_preserves_agent_notes() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("pipelines/pipe-1/SHARED_CONTEXT.md");
        let mut ctx = SharedContext::new("pipe-1", &steps());

        ctx.write_to(&path, "Ship it").unwrap();
        let mut content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(NOTES_HEADING));
        content.push_str("\n- worker-2: renamed Token to Lexeme\n");
        std::fs::write(&path, &content).unwrap();

        ctx.set_step_status("plan", StepStatus::Running).unwrap();
        ctx.write_to(&path, "Ship it").unwrap();

        let refreshed = std::fs::read_to_string(&path).unwrap();
        assert!(refreshed.contains("### plan (`plan`): running"));
        assert!(refreshed.contains("renamed Token to Lexeme"));
        assert_eq!(refreshed.matches(STATUS_BEGIN).count(), 1);
    }

    #[test]
    fn splice_without_markers_keeps_old_text() {
        let spliced = splice_status_block("hand-written notes\n", "BLOCK\n");
        assert_eq!(spliced, "BLOCK\n\nhand-written notes\n");
    }

    #[test]
    fn unknown_step_is_not_found() {
        let mut ctx = SharedContext::new("pipe-1", &steps());
        assert!(matches!(
            ctx.set_step_status("ghost", StepStatus::Failed),
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
