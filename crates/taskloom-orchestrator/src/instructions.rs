use crate::agents::AgentProfile;
use crate::types::{Task, WorkerRole};

/// Renders the instruction payload handed to a worker at launch.
///
/// The payload is plain markdown: the agent's system prompt, the task itself,
/// where the task sits inside a pool or pipeline, and the exact progress
/// reporting contract the orchestrator polls for.
pub fn build_instructions(task: &Task, agent: &AgentProfile, progress_ref: &str) -> String {
    let mut out = String::new();

    if let Some(prompt) = agent.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        out.push_str(prompt.trim());
        out.push_str("\n\n");
    }

    out.push_str(&format!("# Task: {}\n\n", task.title));
    out.push_str(&format!("- Task id: `{}`\n", task.id));
    out.push_str(&format!("- Project: `{}`\n", task.project_id));
    out.push_str(&format!(
        "- Working directory: `{}`\n",
        task.working_directory.display()
    ));
    out.push_str(&format!("- Time limit: {} minutes\n", task.timeout_minutes));
    if task.retry_count > 0 {
        out.push_str(&format!(
            "- Attempt: {} of {}\n",
            task.retry_count + 1,
            task.max_retries + 1
        ));
    }
    out.push('\n');

    if !task.description.trim().is_empty() {
        out.push_str(task.description.trim());
        out.push_str("\n\n");
    }

    if let Some(link) = &task.link {
        out.push_str("## Coordination\n\n");
        let role = match link.role {
            WorkerRole::Peer => "peer worker",
            WorkerRole::Primary => "primary worker; reviewers start after you finish",
            WorkerRole::Reviewer => "reviewer of the primary worker's output",
        };
        out.push_str(&format!(
            "You are worker {} of {} ({}) in pool `{}`.\n",
            link.worker_index + 1,
            link.worker_count,
            role,
            link.pool_id
        ));
        if let Some(step_id) = &link.step_id {
            out.push_str(&format!(
                "This pool runs step `{}` of pipeline `{}`.\n",
                step_id, link.parent_task_id
            ));
        }
        out.push('\n');
    }

    out.push_str("## Progress reporting\n\n");
    out.push_str(&format!(
        "Overwrite `{}` with a single JSON object whenever you make progress:\n\n",
        progress_ref
    ));
    out.push_str(
        "```json\n{ \"percentage\": 40, \"message\": \"what you are doing\", \"timestamp\": 1700000000000 }\n```\n\n",
    );
    out.push_str(
        "`percentage` is an integer from 0 to 100 and `timestamp` is epoch milliseconds. \
When you are done, write a final snapshot with `\"exitCode\": 0` and a one-line summary \
as the message. If you cannot finish, write a non-zero `exitCode` and the reason.\n",
    );

    out
}
