//! Headless CLI surface over the coordination core.
//!
//! Exit codes: 0 on success, 2 on usage/parse errors (`usage_error` in
//! `--json` output), 1 otherwise. The TUI is a separate consumer of the
//! same core; nothing here is TUI-specific.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::json;
use tracing::warn;

use crate::discovery;
use crate::error::CoreError;
use crate::events::{self, CancelToken, Event};
use crate::git::{GitAdapter, GitCli};
use crate::paths;
use crate::ports::PortAllocator;
use crate::registry::ProjectRegistry;
use crate::scripts::runner::{RunnerConfig, ScriptRunner};
use crate::scripts::{self, ScriptKind};
use crate::session::supervisor::SessionSupervisor;
use crate::session::{SessionConfig, tmux};
use crate::workspace::store::WorkspaceStore;
use crate::workspace::{Workspace, sort_workspaces};

#[derive(Parser, Debug)]
#[command(
    name = "amux",
    version,
    about = "Orchestrate coding-assistant agents across git worktrees and tmux"
)]
struct Cli {
    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage registered projects
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Inspect and manage workspaces
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
    /// Start the workspace's run script and stream its output
    Run { workspace: String },
    /// Run the workspace's setup commands
    Setup { workspace: String },
    /// Stop the workspace's running scripts
    Stop { workspace: String },
    /// Run the archive script and mark the workspace archived
    Archive { workspace: String },
    /// Tmux session maintenance
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Generate shell completions
    Completions { shell: Shell },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    /// Register a repository
    Add { path: String },
    /// Unregister a repository
    Remove { path: String },
    /// List registered repositories
    List,
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommand {
    /// List workspaces across registered projects
    List {
        /// Only workspaces of this repository
        #[arg(long)]
        repo: Option<String>,
    },
    /// Show one workspace
    Show { workspace: String },
    /// Create a worktree-backed workspace
    Create {
        repo: String,
        name: String,
        /// Base ref for the new branch
        #[arg(long)]
        base: Option<String>,
    },
    /// Remove a workspace and its worktree
    Remove { workspace: String },
}

#[derive(Subcommand, Debug)]
enum SessionsCommand {
    /// Kill amux tmux sessions whose workspaces no longer exist
    Cleanup,
}

pub fn run() -> u8 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = e.exit_code();
            let _ = e.print();
            return u8::try_from(code).unwrap_or(2);
        }
    };

    let json = cli.json;
    match dispatch(cli) {
        Ok(()) => 0,
        // A benign race means the work was already done.
        Err(err) if err.is_benign() => 0,
        Err(err) => {
            if json {
                println!(
                    "{}",
                    json!({ "error": { "code": err.code(), "message": err.to_string() } })
                );
            } else {
                eprintln!("error: {err}");
            }
            if err.is_usage() { 2 } else { 1 }
        }
    }
}

fn dispatch(cli: Cli) -> Result<(), CoreError> {
    let json = cli.json;
    match cli.command {
        Commands::Project(command) => project(command, json),
        Commands::Workspace(command) => workspace(command, json),
        Commands::Run { workspace } => run_script(&workspace, ScriptKind::Run),
        Commands::Setup { workspace } => setup(&workspace),
        Commands::Stop { workspace } => stop(&workspace),
        Commands::Archive { workspace } => archive(&workspace),
        Commands::Sessions(SessionsCommand::Cleanup) => sessions_cleanup(json),
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "amux", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn default_registry() -> Result<ProjectRegistry, CoreError> {
    Ok(ProjectRegistry::new(ProjectRegistry::default_path()?))
}

fn default_store() -> Result<WorkspaceStore, CoreError> {
    Ok(WorkspaceStore::new(WorkspaceStore::default_root()?))
}

fn project(command: ProjectCommand, json: bool) -> Result<(), CoreError> {
    let registry = default_registry()?;
    match command {
        ProjectCommand::Add { path } => {
            registry.add_project(&path)?;
            println!("added {}", paths::canonicalize_strict(&path)?);
            Ok(())
        }
        ProjectCommand::Remove { path } => {
            registry.remove_project(&path)?;
            println!("removed {}", paths::canonicalize_strict(&path)?);
            Ok(())
        }
        ProjectCommand::List => {
            let projects = registry.load()?;
            if json {
                println!("{}", json!({ "projects": projects }));
            } else {
                for path in projects {
                    println!("{path}");
                }
            }
            Ok(())
        }
    }
}

fn workspace(command: WorkspaceCommand, json: bool) -> Result<(), CoreError> {
    match command {
        WorkspaceCommand::List { repo } => list_workspaces(repo.as_deref(), json),
        WorkspaceCommand::Show { workspace } => {
            let store = default_store()?;
            let ws = resolve_workspace(&store, &workspace)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ws).map_err(|e| CoreError::Usage(e.to_string()))?
                );
            } else {
                println!("{}  {}  {}  {}", ws.id(), ws.name, ws.branch, ws.root);
                for tab in &ws.open_tabs {
                    println!("  tab {} ({}) {}", tab.name, tab.assistant, tab.session_name);
                }
                if let Ok(status) = GitCli::new().status(Path::new(&ws.root)) {
                    if status.clean() {
                        println!("  status: clean");
                    } else {
                        println!(
                            "  status: {} modified, {} untracked",
                            status.modified, status.untracked
                        );
                    }
                }
                match crate::workspace::attempt::load(Path::new(&ws.root)) {
                    Ok(Some(record)) => {
                        println!(
                            "  attempt {} ({})",
                            record.attempt_id,
                            record.status.as_deref().unwrap_or("unknown")
                        );
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("warning: {e}"),
                }
            }
            Ok(())
        }
        WorkspaceCommand::Create { repo, name, base } => create_workspace(&repo, &name, base),
        WorkspaceCommand::Remove { workspace } => remove_workspace(&workspace),
    }
}

fn list_workspaces(repo: Option<&str>, json: bool) -> Result<(), CoreError> {
    let store = default_store()?;

    let mut workspaces = if let Some(repo) = repo {
        store.list_by_repo(&paths::canonicalize_strict(repo)?)?
    } else {
        let registry = default_registry()?;
        let git = GitCli::new();
        let (projects, errors) = discovery::discover_all(&git, &store, &registry.load()?);
        for (path, error) in &errors {
            warn!(project = %path, error = %error, "discovery failed");
            eprintln!("warning: {path}: {error}");
        }
        let mut all = Vec::new();
        for project in projects {
            for (root, error) in &project.failures {
                eprintln!("warning: {}: {root}: {error}", project.name);
            }
            all.extend(project.workspaces);
        }
        all
    };
    sort_workspaces(&mut workspaces);

    if json {
        let body = serde_json::to_string_pretty(&workspaces)
            .map_err(|e| CoreError::Usage(e.to_string()))?;
        println!("{body}");
    } else {
        for ws in &workspaces {
            println!(
                "{}  {:20}  {:24}  {}",
                ws.id(),
                ws.name,
                ws.branch,
                ws.root
            );
        }
    }
    Ok(())
}

fn create_workspace(repo: &str, name: &str, base: Option<String>) -> Result<(), CoreError> {
    let repo = paths::canonicalize_strict(repo)?;
    let git = GitCli::new();
    let store = default_store()?;

    let worktree = git.add_worktree(Path::new(&repo), name, base.as_deref())?;
    let root = paths::normalize(&worktree.root.to_string_lossy());

    let mut ws = Workspace::skeleton(&worktree.name, &worktree.branch, &repo, &root);
    ws.created = Some(chrono::Utc::now());
    ws.base_ref = base.unwrap_or_default();
    ws.apply_defaults();
    let id = store.save(&ws)?;

    let project = scripts::load_project_scripts(Path::new(&repo))?;
    if let Some(warning) = &project.warning {
        eprintln!("warning: {warning}");
    }

    let bus = events::EventBus::detached();
    let ports = Arc::new(PortAllocator::default());
    let runner = ScriptRunner::new(RunnerConfig::default(), bus, ports);
    let setup_result = runner.run_setup(&ws, &project.scripts, &CancelToken::never());
    runner.shutdown();
    setup_result?;

    println!("{id}  {}", ws.root);
    Ok(())
}

fn remove_workspace(key: &str) -> Result<(), CoreError> {
    let store = default_store()?;
    let ws = resolve_workspace(&store, key)?;
    let id = ws.id();

    let bus = events::EventBus::detached();
    let ports = Arc::new(PortAllocator::default());
    let runner = ScriptRunner::new(RunnerConfig::default(), bus, Arc::clone(&ports));
    runner.stop(&ws)?;
    runner.shutdown();

    for tab in &ws.open_tabs {
        tmux::kill_session(&tab.session_name)?;
    }

    let git = GitCli::new();
    git.remove_worktree(Path::new(&ws.repo), Path::new(&ws.root))?;
    store.delete(&id)?;
    ports.release(&ws.root);

    println!("removed {} ({})", ws.name, id);
    Ok(())
}

fn setup(key: &str) -> Result<(), CoreError> {
    let store = default_store()?;
    let ws = resolve_workspace(&store, key)?;
    let project = scripts::load_project_scripts(Path::new(&ws.repo))?;
    if let Some(warning) = &project.warning {
        eprintln!("warning: {warning}");
    }

    let bus = events::EventBus::detached();
    let ports = Arc::new(PortAllocator::default());
    let runner = ScriptRunner::new(RunnerConfig::default(), bus, ports);
    let result = runner.run_setup(&ws, &project.scripts, &CancelToken::never());
    runner.shutdown();
    result
}

fn run_script(key: &str, kind: ScriptKind) -> Result<(), CoreError> {
    let store = default_store()?;
    let ws = resolve_workspace(&store, key)?;
    let project = scripts::load_project_scripts(Path::new(&ws.repo))?;
    if let Some(warning) = &project.warning {
        eprintln!("warning: {warning}");
    }

    let (bus, rx) = events::bus();
    let diag_tasks = events::TaskSupervisor::new("diag");
    crate::diag::start(&crate::diag::DiagConfig::from_env(), &bus, &diag_tasks);

    let ports = Arc::new(PortAllocator::default());
    let runner = ScriptRunner::new(RunnerConfig::default(), bus, ports);
    runner.run_script(&ws, kind, &project.scripts)?;

    #[cfg(unix)]
    let mut signals =
        signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT]).ok();

    // Stream output until the script exits (or the user interrupts).
    loop {
        #[cfg(unix)]
        if let Some(signals) = signals.as_mut()
            && signals.pending().next().is_some()
        {
            eprintln!("interrupted, stopping {kind} script");
            runner.stop(&ws)?;
            break;
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::ScriptOutput { line, .. }) => println!("{line}"),
            Ok(_) => {}
            Err(_) => {}
        }
        if !runner.is_running(&ws) {
            while let Ok(Event::ScriptOutput { line, .. }) = rx.try_recv() {
                println!("{line}");
            }
            break;
        }
    }
    runner.shutdown();
    diag_tasks.shutdown();
    Ok(())
}

fn stop(key: &str) -> Result<(), CoreError> {
    let store = default_store()?;
    let ws = resolve_workspace(&store, key)?;
    let bus = events::EventBus::detached();
    let ports = Arc::new(PortAllocator::default());
    let runner = ScriptRunner::new(RunnerConfig::default(), bus, ports);
    let result = runner.stop(&ws);
    runner.shutdown();
    result
}

fn archive(key: &str) -> Result<(), CoreError> {
    let store = default_store()?;
    let ws = resolve_workspace(&store, key)?;
    let project = scripts::load_project_scripts(Path::new(&ws.repo))?;

    if scripts::resolve_command(ScriptKind::Archive, &project.scripts, &ws).is_some() {
        run_script(key, ScriptKind::Archive)?;
    }
    store.set_archived(&ws.id(), true)?;
    println!("archived {}", ws.name);
    Ok(())
}

fn sessions_cleanup(json: bool) -> Result<(), CoreError> {
    let store = Arc::new(default_store()?);
    let supervisor =
        SessionSupervisor::new(SessionConfig::default(), store, events::EventBus::detached());
    let killed = supervisor.cleanup_on_exit();
    supervisor.shutdown();
    let killed = killed?;
    if json {
        println!("{}", json!({ "killed": killed }));
    } else {
        println!("killed {killed} orphaned session(s)");
    }
    Ok(())
}

/// Accept either a workspace id or a unique workspace name.
fn resolve_workspace(store: &WorkspaceStore, key: &str) -> Result<Workspace, CoreError> {
    if paths::validate_workspace_id(key).is_ok()
        && let Some(loaded) = store.load(key)?
    {
        if let Some(warning) = loaded.warning {
            eprintln!("warning: {warning}");
        }
        return Ok(loaded.workspace);
    }

    let matches: Vec<Workspace> = store
        .list()?
        .into_iter()
        .map(|(_, ws)| ws)
        .filter(|ws| ws.name == key)
        .collect();
    match matches.len() {
        0 => Err(CoreError::NotFound(format!("workspace {key}"))),
        1 => Ok(matches.into_iter().next().unwrap()),
        n => Err(CoreError::Usage(format!(
            "workspace name {key} is ambiguous ({n} matches); use the id"
        ))),
    }
}
