//! The tmux verbs the supervisor needs.
//!
//! All session targets are passed as `=name` so tmux matches exactly
//! instead of by prefix. "Session already gone" answers are benign races.

use std::path::Path;

use tracing::debug;

use crate::cmd::Cmd;
use crate::error::CoreError;

/// Exact-match target for a session name.
fn target(name: &str) -> String {
    format!("={name}")
}

fn is_benign_tmux_error(stderr: &str) -> bool {
    let msg = stderr.to_lowercase();
    msg.contains("session not found")
        || msg.contains("can't find session")
        || msg.contains("no server running")
}

/// Create a detached session running `command` in `cwd`.
pub fn new_session(name: &str, cwd: &Path, command: &str) -> Result<(), CoreError> {
    Cmd::new("tmux")
        .args(["new-session", "-d", "-s", name, "-c"])
        .arg(cwd.to_string_lossy())
        .arg(command)
        .run()?;
    debug!(session = %name, "tmux session created");
    Ok(())
}

pub fn has_session(name: &str) -> Result<bool, CoreError> {
    Cmd::new("tmux")
        .args(["has-session", "-t"])
        .arg(target(name))
        .run_as_check()
}

/// Kill a session. Already-dead sessions are success.
pub fn kill_session(name: &str) -> Result<(), CoreError> {
    match Cmd::new("tmux")
        .args(["kill-session", "-t"])
        .arg(target(name))
        .run()
    {
        Ok(_) => Ok(()),
        Err(CoreError::External { stderr, .. }) if is_benign_tmux_error(&stderr) => {
            debug!(session = %name, "session already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// All live session names. No tmux server means no sessions.
pub fn list_sessions() -> Result<Vec<String>, CoreError> {
    match Cmd::new("tmux")
        .args(["list-sessions", "-F", "#{session_name}"])
        .run_and_capture_stdout()
    {
        Ok(output) => Ok(output.lines().map(String::from).collect()),
        Err(CoreError::External { stderr, .. }) if is_benign_tmux_error(&stderr) => {
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Resize the session's active window to the tab's current dimensions.
pub fn resize_window(name: &str, cols: u16, rows: u16) -> Result<(), CoreError> {
    Cmd::new("tmux")
        .args(["resize-window", "-t"])
        .arg(target(name))
        .args(["-x", &cols.to_string(), "-y", &rows.to_string()])
        .run()?;
    Ok(())
}

/// The session's last-activity timestamp, used by the watchdog to tell a
/// stalled reader from an idle session. `None` when the session is gone.
pub fn session_activity(name: &str) -> Option<u64> {
    Cmd::new("tmux")
        .args(["display-message", "-p", "-t"])
        .arg(target(name))
        .arg("#{session_activity}")
        .run_and_capture_stdout()
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_exact_match() {
        assert_eq!(target("amux-abcd1234-0"), "=amux-abcd1234-0");
    }

    #[test]
    fn benign_errors_cover_dead_session_and_dead_server() {
        assert!(is_benign_tmux_error("session not found: amux-x-0"));
        assert!(is_benign_tmux_error("can't find session: amux-x-0"));
        assert!(is_benign_tmux_error(
            "no server running on /tmp/tmux-1000/default"
        ));
        assert!(!is_benign_tmux_error("protocol version mismatch"));
    }
}
