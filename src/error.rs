use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error kinds shared by the coordination components.
///
/// `BenignRace` is swallowed at the boundary of the component that observes
/// it; every other kind propagates to the caller (and from there onto the
/// event bus as a typed failure event).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller input violates the documented contract (empty path, invalid
    /// workspace id, malformed flag). Maps to exit code 2 on the CLI.
    #[error("invalid input: {0}")]
    Usage(String),

    /// No such workspace, project, or file. Existence probes return
    /// `Ok(None)` instead of this.
    #[error("not found: {0}")]
    NotFound(String),

    /// A file exists but cannot be parsed. Never silently replaced with
    /// defaults; the message names every file involved in recovery.
    #[error("failed to parse {}{}: {reason}", .primary.display(), fmt_backup(.backup))]
    Corruption {
        primary: PathBuf,
        backup: Option<PathBuf>,
        reason: String,
    },

    /// Duplicate add/remove under canonical identity.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Work already done by someone else: process gone, lock already
    /// released, session already dead.
    #[error("benign race: {0}")]
    BenignRace(String),

    /// git, tmux, or a shell command failed.
    #[error("{program} failed{}: {stderr}", .code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    External {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The process is tearing down; callers must not retry.
    #[error("shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn fmt_backup(backup: &Option<PathBuf>) -> String {
    match backup {
        Some(b) => format!(" (backup {})", b.display()),
        None => String::new(),
    }
}

impl CoreError {
    pub fn usage(msg: impl Into<String>) -> Self {
        CoreError::Usage(msg.into())
    }

    pub fn is_benign(&self) -> bool {
        matches!(self, CoreError::BenignRace(_))
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, CoreError::Usage(_))
    }

    /// Stable machine-readable code used in `--json` error output.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Usage(_) => "usage_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Corruption { .. } => "corruption",
            CoreError::Conflict(_) => "conflict",
            CoreError::BenignRace(_) => "benign_race",
            CoreError::External { .. } => "external",
            CoreError::Shutdown => "shutdown",
            CoreError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_message_names_primary_and_backup() {
        let err = CoreError::Corruption {
            primary: PathBuf::from("/tmp/projects.json"),
            backup: Some(PathBuf::from("/tmp/projects.json.bak")),
            reason: "expected value at line 1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/projects.json"));
        assert!(msg.contains("/tmp/projects.json.bak"));
    }

    #[test]
    fn corruption_message_without_backup() {
        let err = CoreError::Corruption {
            primary: PathBuf::from("/tmp/workspace.json"),
            backup: None,
            reason: "unexpected EOF".into(),
        };
        assert!(!err.to_string().contains("backup"));
    }

    #[test]
    fn external_message_includes_exit_code() {
        let err = CoreError::External {
            program: "git".into(),
            code: Some(128),
            stderr: "fatal: not a git repository".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 128"));
        assert!(msg.contains("not a git repository"));
    }
}
