use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// A worker profile the spawn adapter knows how to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Program and arguments overriding the adapter's default command
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            system_prompt: Some(system_prompt.into()),
            command: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AgentFrontmatter {
    id: Option<String>,
    name: Option<String>,
    command: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentProfile>,
}

impl AgentRegistry {
    pub fn new(extra: impl IntoIterator<Item = AgentProfile>) -> Self {
        let mut agents = HashMap::new();
        for agent in default_agents().into_iter().chain(extra) {
            agents.insert(agent.id.clone(), agent);
        }
        Self { agents }
    }

    /// Adds every `*.md` profile in `dir` (YAML frontmatter + prompt body).
    /// A missing directory is not an error.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(OrchestratorError::IoError(format!(
                    "Failed to read agent directory {}: {}",
                    dir.display(),
                    err
                )))
            }
        };

        let mut loaded = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|v| v.to_str()) != Some("md") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            match parse_agent_markdown(&raw, &path) {
                Some(agent) => {
                    self.register(agent);
                    loaded += 1;
                }
                None => tracing::warn!("Skipping agent file without frontmatter: {}", path.display()),
            }
        }
        Ok(loaded)
    }

    pub fn register(&mut self, agent: AgentProfile) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn resolve(&self, agent_id: &str) -> Result<&AgentProfile> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| OrchestratorError::Validation(format!("Unknown agent: {}", agent_id)))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn list(&self) -> Vec<AgentProfile> {
        let mut agents = self.agents.values().cloned().collect::<Vec<_>>();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn default_agents() -> Vec<AgentProfile> {
    vec![
        AgentProfile::new(
            "worker",
            "You are an implementation agent. Make the requested change in the working \
directory, keep edits focused on your assigned scope, and report progress as you go.",
        ),
        AgentProfile::new(
            "evaluator",
            "You are an evaluation agent. Inspect the workspace and the request, then \
write down the plan and the risks other agents need before they start.",
        ),
        AgentProfile::new(
            "integrator",
            "You are an integration agent. Combine the outputs of earlier steps into one \
consistent result and resolve conflicts between them.",
        ),
        AgentProfile::new(
            "reviewer",
            "You are a review agent. Read the produced changes critically and record \
concrete findings; do not rewrite the work yourself unless asked.",
        ),
        AgentProfile::new(
            "tester",
            "You are a testing agent. Exercise the produced changes, add or run tests, \
and report failures with reproduction steps.",
        ),
    ]
}

fn parse_agent_markdown(raw: &str, path: &Path) -> Option<AgentProfile> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        return None;
    }
    let mut parts = trimmed.splitn(3, "---");
    let _ = parts.next();
    let frontmatter = parts.next()?.trim();
    let body = parts.next()?.trim().to_string();
    let parsed: AgentFrontmatter = serde_yaml::from_str(frontmatter).ok()?;
    let default_id = path.file_stem()?.to_string_lossy().to_string();
    let id = parsed.id.unwrap_or(default_id);
    Some(AgentProfile {
        name: parsed.name.unwrap_or_else(|| id.clone()),
        id,
        system_prompt: if body.is_empty() { None } else { Some(body) },
        command: parsed.command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_pipeline_roles() {
        let registry = AgentRegistry::default();
        for id in ["worker", "evaluator", "integrator", "reviewer", "tester"] {
            assert!(registry.contains(id), "missing {}", id);
        }
        assert!(matches!(
            registry.resolve("ghost"),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn load_dir_reads_frontmatter_profiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("docs-writer.md"),
            "---\nname: Docs Writer\ncommand: [\"docs-agent\", \"--quiet\"]\n---\nWrite docs.\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("broken.md"), "no frontmatter").unwrap();

        let mut registry = AgentRegistry::default();
        let loaded = registry.load_dir(dir.path()).unwrap();

        assert_eq!(loaded, 1);
        let agent = registry.resolve("docs-writer").unwrap();
        assert_eq!(agent.name, "Docs Writer");
        assert_eq!(agent.system_prompt.as_deref(), Some("Write docs."));
        assert_eq!(
            agent.command,
            Some(vec!["docs-agent".to_string(), "--quiet".to_string()])
        );
    }

    #[test]
    fn load_dir_missing_directory_is_empty() {
        let mut registry = AgentRegistry::default();
        let loaded = registry
            .load_dir(Path::new("/definitely/not/here"))
            .unwrap();
        assert_eq!(loaded, 0);
    }
}
