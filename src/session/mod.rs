//! Session supervision: one tmux session per agent tab.
//!
//! The tmux session is the durable thing — it survives amux crashes until
//! explicitly cleaned. The supervisor's job is binding a PTY reader to each
//! session, coalescing output for the UI, and noticing when a reader or a
//! session dies.

pub mod pty;
pub mod screen;
pub mod supervisor;
pub mod tmux;

use std::time::Duration;

use crate::paths;

pub const SESSION_PREFIX: &str = "amux-";

/// Lifecycle of a tab's session as tracked in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabState {
    Starting,
    Running,
    Detached,
    Reattaching,
    Closing,
    Closed,
    /// tmux reported the session dead while we believed it was running.
    Crashed,
}

impl std::fmt::Display for TabState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TabState::Starting => "starting",
            TabState::Running => "running",
            TabState::Detached => "detached",
            TabState::Reattaching => "reattaching",
            TabState::Closing => "closing",
            TabState::Closed => "closed",
            TabState::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// Tuning knobs for PTY output delivery and stall detection.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Minimum interval between output frames delivered to the UI.
    pub frame_budget: Duration,
    /// Per-tab ring buffer bound; oldest bytes are dropped past this.
    pub ring_capacity: usize,
    /// Watchdog cadence for stalled-reader detection.
    pub watchdog_tick: Duration,
    /// Dedupe window for identical mouse motion events.
    pub mouse_motion_window: Duration,
    /// Throttle window for wheel events, independent of motion.
    pub wheel_window: Duration,
    /// Initial PTY dimensions until the UI reports real ones.
    pub rows: u16,
    pub cols: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_budget: Duration::from_millis(15),
            ring_capacity: 256 * 1024,
            watchdog_tick: Duration::from_secs(2),
            mouse_motion_window: Duration::from_millis(15),
            wheel_window: Duration::from_millis(15),
            rows: 24,
            cols: 80,
        }
    }
}

/// `amux-<workspace-short>-<tab-ordinal>`.
pub fn session_name(workspace_id: &str, ordinal: usize) -> String {
    format!("{SESSION_PREFIX}{}-{ordinal}", paths::id_short(workspace_id))
}

/// Parse a session name back into `(workspace id prefix, tab ordinal)`.
pub fn parse_session_name(name: &str) -> Option<(&str, usize)> {
    let rest = name.strip_prefix(SESSION_PREFIX)?;
    let (id_short, ordinal) = rest.rsplit_once('-')?;
    if id_short.is_empty() {
        return None;
    }
    Some((id_short, ordinal.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_prefixed_and_ordinal() {
        let name = session_name("0123456789abcdef", 2);
        assert_eq!(name, "amux-01234567-2");
    }

    #[test]
    fn parse_round_trips() {
        let name = session_name("0123456789abcdef", 7);
        assert_eq!(parse_session_name(&name), Some(("01234567", 7)));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_session_name("main"), None);
        assert_eq!(parse_session_name("amux-"), None);
        assert_eq!(parse_session_name("amux-abc-x"), None);
        assert_eq!(parse_session_name("wm-feature-1"), None);
    }
}
