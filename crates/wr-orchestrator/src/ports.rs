//! Explicit dependencies injected at construction.
//!
//! Workflow discovery and workspace/git probing are external collaborators;
//! the orchestrator consumes them behind small traits so tests (and hosts)
//! can swap them freely.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use wr_workflow::WorkflowDefinition;

/// Supplies authored workflow definitions by id.
pub trait WorkflowSource: Send + Sync {
    fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition>;

    /// All known workflow ids, in stable order.
    fn list(&self) -> Vec<String>;
}

/// A fixed set of definitions held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowSource {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl InMemoryWorkflowSource {
    pub fn new(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        Self {
            workflows: definitions
                .into_iter()
                .map(|definition| (definition.id.clone(), definition))
                .collect(),
        }
    }
}

impl WorkflowSource for InMemoryWorkflowSource {
    fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.get(workflow_id).cloned()
    }

    fn list(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }
}

/// What a workspace looks like right now, as far as ranking cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    pub head: Option<String>,
    pub branch: Option<String>,
}

/// Resolves workspace anchors (git head and branch) for resume ranking.
pub trait WorkspaceProbe: Send + Sync {
    fn snapshot(&self, workspace_path: &Path) -> WorkspaceSnapshot;
}

/// Probes via the `git` binary; missing repos yield an empty snapshot.
#[derive(Debug, Clone, Default)]
pub struct GitWorkspaceProbe;

impl WorkspaceProbe for GitWorkspaceProbe {
    fn snapshot(&self, workspace_path: &Path) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            head: git_stdout(workspace_path, &["rev-parse", "HEAD"]),
            branch: git_stdout(workspace_path, &["rev-parse", "--abbrev-ref", "HEAD"]),
        }
    }
}

fn git_stdout(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(dir).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Fixed answers for tests and non-git hosts.
#[derive(Debug, Clone, Default)]
pub struct StaticWorkspaceProbe {
    pub snapshot: WorkspaceSnapshot,
}

impl WorkspaceProbe for StaticWorkspaceProbe {
    fn snapshot(&self, _workspace_path: &Path) -> WorkspaceSnapshot {
        self.snapshot.clone()
    }
}
