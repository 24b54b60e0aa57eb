// Orchestrator Scheduling Rules
// Dispatch ordering for pending tasks and DAG validation for pipeline steps

use crate::types::{Task, TaskStatus};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

// ============================================================================
// Dispatch Ordering
// ============================================================================

/// Urgent before low, then oldest first, then id so equal tasks sort the same
/// way on every sweep.
pub fn dispatch_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Pending worker tasks in dispatch order, at most `limit` of them.
pub fn select_dispatchable(tasks: &[Task], limit: usize) -> Vec<Task> {
    let mut pending: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending && !t.kind.is_container())
        .collect();
    pending.sort_by(|a, b| dispatch_order(a, b));
    pending.into_iter().take(limit).cloned().collect()
}

/// Worker tasks currently holding a concurrency slot.
pub fn count_active(tasks: &[Task]) -> usize {
    tasks
        .iter()
        .filter(|t| t.status.is_running() && !t.kind.is_container())
        .count()
}

// ============================================================================
// Queue Statistics
// ============================================================================

/// Per-status counts over worker tasks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub created: usize,
    pub pending: usize,
    pub active: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub available_slots: usize,
}

impl QueueStats {
    pub fn from_tasks(tasks: &[Task], max_concurrent: usize) -> Self {
        let mut stats = QueueStats::default();
        for task in tasks.iter().filter(|t| !t.kind.is_container()) {
            match task.status {
                TaskStatus::Created => stats.created += 1,
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Active => stats.active += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total += 1;
        }
        stats.available_slots = max_concurrent.saturating_sub(stats.active + stats.processing);
        stats
    }
}

// ============================================================================
// Step Graph
// ============================================================================

/// A node in a dependency graph.
pub trait GraphNode {
    fn node_id(&self) -> &str;
    fn dependencies(&self) -> &[String];
}

/// Checks the graph before anything is dispatched: non-empty, unique ids,
/// known dependencies, no self-edges and no cycles.
pub fn validate_graph<N: GraphNode>(nodes: &[N]) -> Result<(), GraphError> {
    if nodes.is_empty() {
        return Err(GraphError::EmptyStepList);
    }

    let mut ids = HashSet::new();
    for node in nodes {
        if !ids.insert(node.node_id()) {
            return Err(GraphError::DuplicateStepId(node.node_id().to_string()));
        }
    }

    for node in nodes {
        for dep in node.dependencies() {
            if dep == node.node_id() {
                return Err(GraphError::SelfDependency {
                    step_id: node.node_id().to_string(),
                });
            }
            if !ids.contains(dep.as_str()) {
                return Err(GraphError::InvalidDependency {
                    step_id: node.node_id().to_string(),
                    dependency_id: dep.clone(),
                });
            }
        }
    }

    if let Some(path) = detect_cycle(nodes) {
        return Err(GraphError::CycleDetected { path });
    }

    Ok(())
}

/// Returns the first cycle found, as the path of ids closing on itself.
pub fn detect_cycle<N: GraphNode>(nodes: &[N]) -> Option<Vec<String>> {
    let by_id: HashMap<&str, &N> = nodes.iter().map(|n| (n.node_id(), n)).collect();
    let mut finished = HashSet::new();

    for node in nodes {
        let mut path = Vec::new();
        if dfs_cycle(node.node_id(), &by_id, &mut finished, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle<'a, N: GraphNode>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a N>,
    finished: &mut HashSet<&'a str>,
    path: &mut Vec<String>,
) -> bool {
    if let Some(start) = path.iter().position(|p| p == id) {
        path.drain(..start);
        path.push(id.to_string());
        return true;
    }
    if finished.contains(id) {
        return false;
    }

    path.push(id.to_string());
    if let Some(&node) = by_id.get(id) {
        for dep in node.dependencies() {
            if dfs_cycle(dep.as_str(), by_id, finished, path) {
                return true;
            }
        }
    }
    path.pop();
    finished.insert(id);
    false
}

/// Nodes not yet started whose dependencies are all complete, in
/// declaration order.
pub fn ready_nodes<'a, N: GraphNode>(
    nodes: &'a [N],
    is_completed: impl Fn(&str) -> bool,
    is_waiting: impl Fn(&str) -> bool,
) -> Vec<&'a N> {
    nodes
        .iter()
        .filter(|n| is_waiting(n.node_id()))
        .filter(|n| n.dependencies().iter().all(|dep| is_completed(dep)))
        .collect()
}

/// Pipeline graph validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    EmptyStepList,
    DuplicateStepId(String),
    InvalidDependency {
        step_id: String,
        dependency_id: String,
    },
    SelfDependency {
        step_id: String,
    },
    CycleDetected {
        path: Vec<String>,
    },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyStepList => write!(f, "Pipeline has no steps"),
            Self::DuplicateStepId(id) => write!(f, "Duplicate step id '{}'", id),
            Self::InvalidDependency {
                step_id,
                dependency_id,
            } => {
                write!(
                    f,
                    "Step '{}' depends on unknown step '{}'",
                    step_id, dependency_id
                )
            }
            Self::SelfDependency { step_id } => write!(f, "Step '{}' depends on itself", step_id),
            Self::CycleDetected { path } => {
                write!(f, "Cycle detected in step graph: {}", path.join(" -> "))
            }
        }
    }
}

impl std::error::Error for GraphError {}

// ============================================================================
// Tests
// ============================================================================
