//! The session supervisor: binds PTY readers to tmux sessions, one per
//! active tab, and watches them.
//!
//! Reader invariant: at most one live PTY reader per tab. Rebinding bumps
//! a generation counter, trips the old reader's stop flag, and kills its
//! attach client so the blocked read unblocks. The watchdog turns "reader
//! gone but session alive" into a restart request and "session gone" into
//! a crash.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crossbeam_channel::unbounded;
use portable_pty::{ChildKiller, MasterPty};
use tracing::{debug, info, warn};

use super::screen::{MouseEvent, MouseThrottle};
use super::{SESSION_PREFIX, SessionConfig, TabState, parse_session_name, pty, session_name, tmux};
use crate::error::CoreError;
use crate::events::{Event, EventBus, TaskSupervisor};
use crate::paths;
use crate::workspace::store::WorkspaceStore;
use crate::workspace::{TabInfo, Workspace};

struct TabEntry {
    workspace_id: String,
    state: TabState,
    generation: u64,
    stop: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    last_progress: u64,
    last_activity: Option<u64>,
    stall_ticks: u32,
    writer: Option<Box<dyn Write + Send>>,
    master: Option<Box<dyn MasterPty + Send>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    mouse: MouseThrottle,
}

impl TabEntry {
    /// Stop this entry's reader: trip the flag, kill the attach client so
    /// the blocked read sees EOF, drop the PTY handles.
    fn stop_reader(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(mut killer) = self.killer.take() {
            let _ = killer.kill();
        }
        self.writer = None;
        self.master = None;
    }
}

pub struct SessionSupervisor {
    config: SessionConfig,
    store: Arc<WorkspaceStore>,
    bus: EventBus,
    tasks: TaskSupervisor,
    tabs: Arc<Mutex<HashMap<String, TabEntry>>>,
    generation: AtomicU64,
}

impl SessionSupervisor {
    pub fn new(config: SessionConfig, store: Arc<WorkspaceStore>, bus: EventBus) -> Self {
        let supervisor = Self {
            config,
            store,
            bus,
            tasks: TaskSupervisor::new("sessions"),
            tabs: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        };
        supervisor.spawn_watchdog();
        supervisor.spawn_ui_tick();
        supervisor
    }

    /// Open a new tab: allocate the next ordinal, create the tmux session,
    /// record the tab, bind a reader.
    pub fn open(&self, workspace: &Workspace, assistant: &str) -> Result<TabInfo, CoreError> {
        if assistant.trim().is_empty() {
            return Err(CoreError::usage("assistant must not be empty"));
        }
        let workspace_id = workspace.id();
        let ordinal = workspace.open_tabs.len();
        let name = session_name(&workspace_id, ordinal);

        {
            let tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
            if tabs.contains_key(&name) {
                return Err(CoreError::Conflict(format!(
                    "session {name} already open in this process"
                )));
            }
        }

        tmux::new_session(&name, Path::new(&workspace.root), assistant)?;
        let tab = TabInfo {
            assistant: assistant.to_string(),
            name: format!("{assistant} {ordinal}"),
            session_name: name.clone(),
            status: "running".into(),
            created_at: Some(Utc::now()),
        };
        self.store.append_open_tab(&workspace_id, tab.clone())?;
        self.publish_state(&workspace_id, &name, TabState::Starting);

        self.bind_reader(
            &workspace_id,
            &name,
            TabState::Starting,
            self.config.rows,
            self.config.cols,
        )?;
        info!(session = %name, workspace = %workspace.name, "tab opened");
        self.bus.publish(Event::TabCreated {
            workspace_id,
            tab: tab.clone(),
        });
        Ok(tab)
    }

    /// Rebind the reader to an existing session, resizing its window to
    /// the tab's current dimensions.
    pub fn attach(
        &self,
        workspace_id: &str,
        session: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(), CoreError> {
        if !tmux::has_session(session)? {
            self.mark_crashed(workspace_id, session);
            return Err(CoreError::NotFound(format!("tmux session {session}")));
        }
        if let Err(e) = tmux::resize_window(session, cols, rows) {
            warn!(session, error = %e, "resize before attach failed");
        }

        {
            let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = tabs.get_mut(session) {
                entry.stop_reader();
                entry.state = TabState::Reattaching;
            }
        }
        self.publish_state(workspace_id, session, TabState::Reattaching);

        self.bind_reader(workspace_id, session, TabState::Reattaching, rows, cols)?;
        self.bus.publish(Event::TabReattached {
            workspace_id: workspace_id.to_string(),
            session_name: session.to_string(),
        });
        Ok(())
    }

    /// Stop the local reader but leave the tmux session alive. The tab
    /// stays in `openTabs`.
    pub fn detach(&self, workspace_id: &str, session: &str) -> Result<(), CoreError> {
        {
            let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
            let entry = tabs
                .get_mut(session)
                .ok_or_else(|| CoreError::NotFound(format!("tab {session}")))?;
            entry.stop_reader();
            entry.state = TabState::Detached;
        }
        self.publish_state(workspace_id, session, TabState::Detached);
        self.bus.publish(Event::TabDetached {
            workspace_id: workspace_id.to_string(),
            session_name: session.to_string(),
        });
        Ok(())
    }

    /// Kill the tmux session and remove the tab from the workspace.
    pub fn close(&self, workspace_id: &str, session: &str) -> Result<(), CoreError> {
        {
            let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = tabs.get_mut(session) {
                entry.state = TabState::Closing;
                entry.stop_reader();
            }
        }
        self.publish_state(workspace_id, session, TabState::Closing);

        tmux::kill_session(session)?;
        self.store.remove_open_tab(workspace_id, session)?;

        self.tabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session);
        self.publish_state(workspace_id, session, TabState::Closed);
        self.bus.publish(Event::TabClosed {
            workspace_id: workspace_id.to_string(),
            session_name: session.to_string(),
        });
        Ok(())
    }

    /// Kill amux-named tmux sessions whose workspaces no longer exist.
    /// Returns how many were reaped.
    pub fn cleanup_on_exit(&self) -> Result<usize, CoreError> {
        let sessions = tmux::list_sessions()?;
        let known: Vec<String> = self
            .store
            .list()?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let mut killed = 0;
        for session in orphaned_sessions(&sessions, &known) {
            info!(session = %session, "killing orphaned session");
            tmux::kill_session(session)?;
            killed += 1;
        }
        Ok(killed)
    }

    /// Persist and announce the active tab selection.
    pub fn select_tab(&self, workspace_id: &str, index: usize) -> Result<(), CoreError> {
        self.store.set_active_tab(workspace_id, index)?;
        self.bus.publish(Event::TabSelectionChanged {
            workspace_id: workspace_id.to_string(),
            active_tab_index: index,
        });
        Ok(())
    }

    /// Forward input bytes to the tab's PTY.
    pub fn write_input(&self, session: &str, bytes: &[u8]) -> Result<(), CoreError> {
        let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
        let entry = tabs
            .get_mut(session)
            .ok_or_else(|| CoreError::NotFound(format!("tab {session}")))?;
        let writer = entry
            .writer
            .as_mut()
            .ok_or_else(|| CoreError::NotFound(format!("tab {session} is detached")))?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Should this mouse event be forwarded? Unknown sessions admit
    /// everything (nothing to protect).
    pub fn admit_mouse(&self, session: &str, event: MouseEvent) -> bool {
        let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
        match tabs.get_mut(session) {
            Some(entry) => entry.mouse.admit(event),
            None => true,
        }
    }

    /// Resize both the local PTY and the tmux window.
    pub fn resize(&self, session: &str, rows: u16, cols: u16) -> Result<(), CoreError> {
        {
            let tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(master) = tabs.get(session).and_then(|e| e.master.as_deref()) {
                pty::resize(master, rows, cols)?;
            }
        }
        tmux::resize_window(session, cols, rows)
    }

    pub fn tab_state(&self, session: &str) -> Option<TabState> {
        self.tabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session)
            .map(|e| e.state)
    }

    /// Drain every tab through `close`, announce shutdown, join workers.
    pub fn shutdown(&self) {
        let open: Vec<(String, String)> = {
            let tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
            tabs.iter()
                .map(|(session, entry)| (entry.workspace_id.clone(), session.clone()))
                .collect()
        };
        for (workspace_id, session) in open {
            if let Err(e) = self.close(&workspace_id, &session) {
                warn!(session = %session, error = %e, "close during shutdown failed");
            }
        }
        self.bus.publish(Event::Shutdown);
        self.tasks.shutdown();
    }

    fn bind_reader(
        &self,
        workspace_id: &str,
        session: &str,
        via: TabState,
        rows: u16,
        cols: u16,
    ) -> Result<(), CoreError> {
        let attached = pty::attach(session, rows, cols)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicU64::new(0));
        let alive = Arc::new(AtomicBool::new(true));

        let (tx, rx) = unbounded();
        {
            let stop = Arc::clone(&stop);
            let progress = Arc::clone(&progress);
            let alive = Arc::clone(&alive);
            let reader = attached.reader;
            let mut child = attached.child;
            self.tasks
                .spawn(format!("reader:{session}:{generation}"), move |_| {
                    pty::run_reader(reader, tx, stop, progress, alive);
                    // EOF means the attach client died (or was killed);
                    // reap it so it doesn't linger as a zombie.
                    let _ = child.wait();
                });
        }
        {
            let bus = self.bus.clone();
            let session = session.to_string();
            let budget = self.config.frame_budget;
            let capacity = self.config.ring_capacity;
            self.tasks
                .spawn(format!("coalesce:{session}:{generation}"), move |_| {
                    pty::run_coalescer(rx, bus, session, budget, capacity);
                });
        }

        let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stale) = tabs.get_mut(session) {
            // A previous reader is still registered; make sure it is dead
            // before the new generation takes the slot.
            debug!(session, old_generation = stale.generation, "replacing stale reader");
            stale.stop_reader();
        }
        tabs.insert(
            session.to_string(),
            TabEntry {
                workspace_id: workspace_id.to_string(),
                state: TabState::Running,
                generation,
                stop,
                progress,
                alive,
                last_progress: 0,
                last_activity: None,
                stall_ticks: 0,
                writer: Some(attached.writer),
                master: Some(attached.master),
                killer: Some(attached.killer),
                mouse: MouseThrottle::new(
                    self.config.mouse_motion_window,
                    self.config.wheel_window,
                ),
            },
        );
        drop(tabs);

        debug!(session, %via, generation, "reader bound");
        self.publish_state(workspace_id, session, TabState::Running);
        Ok(())
    }

    fn publish_state(&self, workspace_id: &str, session: &str, state: TabState) {
        self.bus.publish(Event::TabStateChanged {
            workspace_id: workspace_id.to_string(),
            session_name: session.to_string(),
            state,
        });
    }

    fn mark_crashed(&self, workspace_id: &str, session: &str) {
        {
            let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = tabs.get_mut(session) {
                entry.stop_reader();
                entry.state = TabState::Crashed;
            }
        }
        self.bus.publish(Event::TabSessionStatus {
            workspace_id: workspace_id.to_string(),
            session_name: session.to_string(),
            status: "crashed".into(),
        });
        self.publish_state(workspace_id, session, TabState::Crashed);
    }

    fn spawn_watchdog(&self) {
        let tabs = Arc::clone(&self.tabs);
        let bus = self.bus.clone();
        self.tasks
            .spawn_ticker("watchdog", self.config.watchdog_tick, move || {
                let mut crashed: Vec<(String, String)> = Vec::new();
                let mut restarts: Vec<(String, String)> = Vec::new();
                {
                    let mut map = tabs.lock().unwrap_or_else(|e| e.into_inner());
                    for (session, entry) in map.iter_mut() {
                        if entry.state != TabState::Running {
                            continue;
                        }

                        let alive = entry.alive.load(Ordering::SeqCst);
                        if !alive {
                            if tmux::has_session(session).unwrap_or(false) {
                                entry.state = TabState::Reattaching;
                                restarts.push((entry.workspace_id.clone(), session.clone()));
                            } else {
                                entry.state = TabState::Crashed;
                                crashed.push((entry.workspace_id.clone(), session.clone()));
                            }
                            continue;
                        }

                        let progress = entry.progress.load(Ordering::SeqCst);
                        let activity = tmux::session_activity(session);
                        let progress_advanced = progress != entry.last_progress;
                        let activity_advanced = activity_advanced(entry.last_activity, activity);

                        let (stalls, restart) =
                            stall_verdict(progress_advanced, activity_advanced, entry.stall_ticks);
                        entry.stall_ticks = stalls;
                        entry.last_progress = progress;
                        if activity.is_some() {
                            entry.last_activity = activity;
                        }
                        if restart {
                            entry.state = TabState::Reattaching;
                            restarts.push((entry.workspace_id.clone(), session.clone()));
                        }
                    }
                }

                for (workspace_id, session) in restarts {
                    warn!(session = %session, "pty reader stalled, requesting restart");
                    bus.publish(Event::SidebarPtyRestart {
                        session_name: session.clone(),
                    });
                    bus.publish(Event::TabStateChanged {
                        workspace_id,
                        session_name: session,
                        state: TabState::Reattaching,
                    });
                }
                for (workspace_id, session) in crashed {
                    warn!(session = %session, "tmux session died");
                    bus.publish(Event::TabSessionStatus {
                        workspace_id: workspace_id.clone(),
                        session_name: session.clone(),
                        status: "crashed".into(),
                    });
                    bus.publish(Event::TabStateChanged {
                        workspace_id,
                        session_name: session,
                        state: TabState::Crashed,
                    });
                }
            });
    }

    fn spawn_ui_tick(&self) {
        let bus = self.bus.clone();
        self.tasks
            .spawn_ticker("ui-tick", std::time::Duration::from_millis(100), move || {
                bus.publish(Event::SidebarPtyTick);
            });
    }
}

fn activity_advanced(prev: Option<u64>, now: Option<u64>) -> bool {
    match (prev, now) {
        (Some(prev), Some(now)) => now > prev,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Stall accounting: progress clears the count, activity without progress
/// raises it, and the second consecutive stalled tick requests a restart.
fn stall_verdict(progress_advanced: bool, activity_advanced: bool, prior: u32) -> (u32, bool) {
    if progress_advanced {
        (0, false)
    } else if activity_advanced {
        let count = prior + 1;
        if count >= 2 { (0, true) } else { (count, false) }
    } else {
        (prior, false)
    }
}

/// Sessions with our prefix whose workspace id prefix matches nothing in
/// the store.
fn orphaned_sessions<'a>(sessions: &'a [String], known_ids: &[String]) -> Vec<&'a str> {
    sessions
        .iter()
        .filter_map(|session| {
            if !session.starts_with(SESSION_PREFIX) {
                return None;
            }
            let (short, _) = parse_session_name(session)?;
            let known = known_ids.iter().any(|id| paths::id_short(id) == short);
            (!known).then_some(session.as_str())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use tempfile::TempDir;

    fn supervisor_in(dir: &TempDir) -> (SessionSupervisor, crossbeam_channel::Receiver<Event>) {
        let (bus, rx) = events::bus();
        let store = Arc::new(WorkspaceStore::new(dir.path().join("workspaces")));
        (
            SessionSupervisor::new(SessionConfig::default(), store, bus),
            rx,
        )
    }

    #[test]
    fn stall_verdict_requires_two_stalled_ticks() {
        // Progress always clears.
        assert_eq!(stall_verdict(true, true, 5), (0, false));
        // First stalled tick counts, second restarts.
        assert_eq!(stall_verdict(false, true, 0), (1, false));
        assert_eq!(stall_verdict(false, true, 1), (0, true));
        // Idle session (no activity) never restarts.
        assert_eq!(stall_verdict(false, false, 1), (1, false));
    }

    #[test]
    fn activity_comparison_handles_missing_samples() {
        assert!(activity_advanced(Some(10), Some(11)));
        assert!(!activity_advanced(Some(10), Some(10)));
        assert!(activity_advanced(None, Some(1)));
        assert!(!activity_advanced(Some(10), None));
        assert!(!activity_advanced(None, None));
    }

    #[test]
    fn orphan_detection_matches_on_id_prefix() {
        let sessions = vec![
            "amux-01234567-0".to_string(),
            "amux-89abcdef-1".to_string(),
            "unrelated".to_string(),
            "amux-notparsed".to_string(),
        ];
        let known = vec!["0123456789abcdef".to_string()];
        let orphans = orphaned_sessions(&sessions, &known);
        assert_eq!(orphans, vec!["amux-89abcdef-1"]);
    }

    #[test]
    fn write_input_to_unknown_tab_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (supervisor, _rx) = supervisor_in(&dir);
        assert!(matches!(
            supervisor.write_input("amux-ffffffff-0", b"x"),
            Err(CoreError::NotFound(_))
        ));
        supervisor.shutdown();
    }

    #[test]
    fn unknown_tabs_admit_all_mouse_events() {
        let dir = TempDir::new().unwrap();
        let (supervisor, _rx) = supervisor_in(&dir);
        assert!(supervisor.admit_mouse("nope", MouseEvent::Motion { x: 1, y: 1 }));
        supervisor.shutdown();
    }

    #[test]
    fn shutdown_with_no_tabs_announces_itself() {
        let dir = TempDir::new().unwrap();
        let (supervisor, rx) = supervisor_in(&dir);
        supervisor.shutdown();
        let mut saw_shutdown = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::Shutdown) {
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown);
    }

    #[test]
    fn open_rejects_empty_assistant() {
        let dir = TempDir::new().unwrap();
        let (supervisor, _rx) = supervisor_in(&dir);
        let ws = Workspace::skeleton("ws", "main", "/repo", "/repo/ws");
        assert!(matches!(
            supervisor.open(&ws, "  "),
            Err(CoreError::Usage(_))
        ));
        supervisor.shutdown();
    }
}
