//! Discovery: reconcile live git worktrees with stored workspace metadata.
//!
//! Discovery owns the identity-bearing fields (`name`, `branch`, `repo`,
//! `root`); the store owns everything else. A corrupted metadata file fails
//! loudly for that workspace instead of silently reverting to defaults.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::CoreError;
use crate::git::GitAdapter;
use crate::paths;
use crate::workspace::Workspace;
use crate::workspace::store::WorkspaceStore;

/// The UI-facing aggregate: one project and its reconciled workspaces.
/// Built on demand, never persisted.
#[derive(Debug)]
pub struct DiscoveredProject {
    pub name: String,
    pub path: String,
    pub workspaces: Vec<Workspace>,
    /// Workspaces whose stored metadata could not be read, keyed by root.
    pub failures: Vec<(String, CoreError)>,
}

/// Reconcile one project: enumerate worktrees, overlay stored metadata,
/// default what was never stored.
pub fn discover_project(
    git: &dyn GitAdapter,
    store: &WorkspaceStore,
    project_path: &str,
) -> Result<DiscoveredProject, CoreError> {
    let worktrees = git.list_worktrees(Path::new(project_path))?;
    debug!(project = %project_path, count = worktrees.len(), "worktrees listed");

    let mut workspaces = Vec::new();
    let mut failures = Vec::new();

    for worktree in worktrees {
        let root = paths::normalize(&worktree.root.to_string_lossy());
        let skeleton = Workspace::skeleton(&worktree.name, &worktree.branch, project_path, &root);

        match store.load_metadata_for(&skeleton) {
            Ok(Some(stored)) => workspaces.push(stored),
            Ok(None) => {
                let mut ws = skeleton;
                ws.apply_defaults();
                workspaces.push(ws);
            }
            Err(e) => {
                warn!(root = %root, error = %e, "workspace metadata unreadable");
                failures.push((root, e));
            }
        }
    }

    Ok(DiscoveredProject {
        name: project_name(project_path),
        path: project_path.to_string(),
        workspaces,
        failures,
    })
}

/// Discover every registered project. Projects whose worktree listing fails
/// are reported separately so one broken repository doesn't hide the rest.
pub fn discover_all(
    git: &dyn GitAdapter,
    store: &WorkspaceStore,
    project_paths: &[String],
) -> (Vec<DiscoveredProject>, Vec<(String, CoreError)>) {
    let mut projects = Vec::new();
    let mut errors = Vec::new();
    for path in project_paths {
        match discover_project(git, store, path) {
            Ok(project) => projects.push(project),
            Err(e) => errors.push((path.clone(), e)),
        }
    }
    (projects, errors)
}

fn project_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
