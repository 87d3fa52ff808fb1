//! Per-project lifecycle scripts: configuration and env injection.
//!
//! The project config lives at `<repo>/.amux/workspaces.json`; the legacy
//! filename `worktrees.json` is accepted on read only. Workspace-level
//! overrides (the workspace's `scripts` field) apply when the project-level
//! option is absent.

pub mod runner;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ports::PortAllocator;
use crate::workspace::Workspace;

pub const PROJECT_CONFIG_FILE: &str = "workspaces.json";
pub const LEGACY_PROJECT_CONFIG_FILE: &str = "worktrees.json";

/// Which lifecycle script is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Setup,
    Run,
    Archive,
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptKind::Setup => write!(f, "setup"),
            ScriptKind::Run => write!(f, "run"),
            ScriptKind::Archive => write!(f, "archive"),
        }
    }
}

/// Project-level script configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectScripts {
    /// Commands run once after workspace creation, in order.
    #[serde(rename = "setup-workspace", skip_serializing_if = "Vec::is_empty")]
    pub setup_workspace: Vec<String>,
    /// The long-running dev server for the workspace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    /// Finalize/archive a workspace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedProjectScripts {
    pub scripts: ProjectScripts,
    /// Set when the data came from the legacy filename.
    pub warning: Option<String>,
}

fn config_path(repo: &Path) -> PathBuf {
    repo.join(".amux").join(PROJECT_CONFIG_FILE)
}

fn legacy_config_path(repo: &Path) -> PathBuf {
    repo.join(".amux").join(LEGACY_PROJECT_CONFIG_FILE)
}

/// Load the project script config. Missing files mean "no scripts";
/// unparseable files are corruption, not defaults.
pub fn load_project_scripts(repo: &Path) -> Result<LoadedProjectScripts, CoreError> {
    let primary = config_path(repo);
    match read_config(&primary)? {
        Some(scripts) => Ok(LoadedProjectScripts {
            scripts,
            warning: None,
        }),
        None => {
            let legacy = legacy_config_path(repo);
            match read_config(&legacy)? {
                Some(scripts) => Ok(LoadedProjectScripts {
                    scripts,
                    warning: Some(format!(
                        "{} uses the legacy name {LEGACY_PROJECT_CONFIG_FILE}; rename it to {PROJECT_CONFIG_FILE}",
                        legacy.display()
                    )),
                }),
                None => Ok(LoadedProjectScripts {
                    scripts: ProjectScripts::default(),
                    warning: None,
                }),
            }
        }
    }
}

fn read_config(path: &Path) -> Result<Option<ProjectScripts>, CoreError> {
    match fs::read(path) {
        Ok(bytes) => {
            let scripts = serde_json::from_slice(&bytes).map_err(|e| CoreError::Corruption {
                primary: path.to_path_buf(),
                backup: None,
                reason: e.to_string(),
            })?;
            Ok(Some(scripts))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::Io(e)),
    }
}

/// Resolve the command for a kind: project config first, the workspace's
/// own `scripts` field only when the project says nothing.
pub fn resolve_command(
    kind: ScriptKind,
    project: &ProjectScripts,
    workspace: &Workspace,
) -> Option<String> {
    match kind {
        ScriptKind::Run => project
            .run
            .clone()
            .or_else(|| workspace.scripts.run.clone()),
        ScriptKind::Archive => project
            .archive
            .clone()
            .or_else(|| workspace.scripts.archive.clone()),
        ScriptKind::Setup => None,
    }
}

/// Resolve the ordered setup command list.
pub fn resolve_setup(project: &ProjectScripts, workspace: &Workspace) -> Vec<String> {
    if !project.setup_workspace.is_empty() {
        project.setup_workspace.clone()
    } else {
        workspace.scripts.setup.clone()
    }
}

/// Environment injected into every script: the inherited process env plus
/// the amux variables and the workspace's own `env` map.
pub fn script_env(workspace: &Workspace, ports: &PortAllocator) -> Vec<(String, String)> {
    let (base, end) = ports.range(&workspace.root);
    let mut env = vec![
        ("AMUX_WORKSPACE_NAME".to_string(), workspace.name.clone()),
        ("AMUX_WORKSPACE_ROOT".to_string(), workspace.root.clone()),
        (
            "AMUX_WORKSPACE_BRANCH".to_string(),
            workspace.branch.clone(),
        ),
        ("ROOT_WORKSPACE_PATH".to_string(), workspace.repo.clone()),
        ("AMUX_PORT".to_string(), base.to_string()),
        ("AMUX_PORT_RANGE".to_string(), format!("{base}-{end}")),
    ];
    for (key, value) in &workspace.env {
        env.push((key.clone(), value.clone()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PortAllocator, PortConfig};
    use tempfile::TempDir;

    fn write_config(repo: &Path, file: &str, body: &str) {
        fs::create_dir_all(repo.join(".amux")).unwrap();
        fs::write(repo.join(".amux").join(file), body).unwrap();
    }

    #[test]
    fn missing_config_is_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = load_project_scripts(dir.path()).unwrap();
        assert_eq!(loaded.scripts, ProjectScripts::default());
        assert!(loaded.warning.is_none());
    }

    #[test]
    fn parses_recognized_options() {
        let dir = TempDir::new().unwrap();
        write_config(
            dir.path(),
            PROJECT_CONFIG_FILE,
            r#"{"setup-workspace":["npm install","cp .env.example .env"],"run":"npm run dev","archive":"./scripts/archive.sh"}"#,
        );
        let loaded = load_project_scripts(dir.path()).unwrap();
        assert_eq!(loaded.scripts.setup_workspace.len(), 2);
        assert_eq!(loaded.scripts.run.as_deref(), Some("npm run dev"));
        assert_eq!(
            loaded.scripts.archive.as_deref(),
            Some("./scripts/archive.sh")
        );
    }

    #[test]
    fn legacy_filename_reads_with_warning() {
        let dir = TempDir::new().unwrap();
        write_config(
            dir.path(),
            LEGACY_PROJECT_CONFIG_FILE,
            r#"{"run":"make dev"}"#,
        );
        let loaded = load_project_scripts(dir.path()).unwrap();
        assert_eq!(loaded.scripts.run.as_deref(), Some("make dev"));
        assert!(loaded.warning.is_some());
    }

    #[test]
    fn current_filename_wins_over_legacy() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), PROJECT_CONFIG_FILE, r#"{"run":"new"}"#);
        write_config(dir.path(), LEGACY_PROJECT_CONFIG_FILE, r#"{"run":"old"}"#);
        let loaded = load_project_scripts(dir.path()).unwrap();
        assert_eq!(loaded.scripts.run.as_deref(), Some("new"));
        assert!(loaded.warning.is_none());
    }

    #[test]
    fn corrupt_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), PROJECT_CONFIG_FILE, "{nope");
        assert!(matches!(
            load_project_scripts(dir.path()),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn workspace_scripts_apply_only_when_project_is_silent() {
        let mut ws = Workspace::skeleton("ws", "main", "/r", "/r/w");
        ws.scripts.run = Some("ws-run".into());

        let mut project = ProjectScripts::default();
        assert_eq!(
            resolve_command(ScriptKind::Run, &project, &ws).as_deref(),
            Some("ws-run")
        );

        project.run = Some("project-run".into());
        assert_eq!(
            resolve_command(ScriptKind::Run, &project, &ws).as_deref(),
            Some("project-run")
        );
    }

    #[test]
    fn env_injection_includes_ports_and_user_env() {
        let mut ws = Workspace::skeleton("ws-a", "feat/x", "/repo", "/repo/ws-a");
        ws.env.insert("CUSTOM".into(), "yes".into());
        let ports = PortAllocator::new(PortConfig {
            start: 6200,
            stride: 10,
        });

        let env = script_env(&ws, &ports);
        let lookup = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(lookup("AMUX_WORKSPACE_NAME"), Some("ws-a"));
        assert_eq!(lookup("AMUX_WORKSPACE_ROOT"), Some("/repo/ws-a"));
        assert_eq!(lookup("AMUX_WORKSPACE_BRANCH"), Some("feat/x"));
        assert_eq!(lookup("ROOT_WORKSPACE_PATH"), Some("/repo"));
        assert_eq!(lookup("AMUX_PORT"), Some("6200"));
        assert_eq!(lookup("AMUX_PORT_RANGE"), Some("6200-6209"));
        assert_eq!(lookup("CUSTOM"), Some("yes"));
    }
}
