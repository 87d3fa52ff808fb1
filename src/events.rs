//! Event bus: fan-in from worker threads to the single UI consumer pump.
//!
//! Producers never block. The channel is bounded; when the consumer falls
//! behind, events are dropped and counted rather than stalling a PTY
//! reader. High-frequency streams are coalesced upstream (the session
//! supervisor batches PTY bytes into frames before publishing).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded, select, tick};
use tracing::{debug, warn};

use crate::discovery::DiscoveredProject;
use crate::git::WorktreeStatus;
use crate::scripts::ScriptKind;
use crate::session::TabState;
use crate::workspace::{TabInfo, Workspace};

/// Typed events consumed by the UI pump. Some variants are produced only
/// by the TUI layer (activation, previews, watcher wiring); they are part
/// of the bus contract even though the core never constructs them.
#[derive(Debug)]
#[allow(dead_code)]
pub enum Event {
    ProjectsLoaded(Vec<DiscoveredProject>),
    WorkspaceActivated { id: String },
    WorkspacePreviewed { id: String },
    WorkspaceCreated(Box<Workspace>),
    WorkspaceDeleted { id: String },
    WorkspaceCreateFailed { name: String, error: String },
    WorkspaceDeleteFailed { id: String, error: String },
    GitStatusRequest { root: String },
    GitStatusResult { root: String, status: WorktreeStatus },
    TabCreated { workspace_id: String, tab: TabInfo },
    TabClosed { workspace_id: String, session_name: String },
    TabDetached { workspace_id: String, session_name: String },
    TabReattached { workspace_id: String, session_name: String },
    TabStateChanged { workspace_id: String, session_name: String, state: TabState },
    TabSessionStatus { workspace_id: String, session_name: String, status: String },
    TabSelectionChanged { workspace_id: String, active_tab_index: usize },
    SidebarPtyOutput { session_name: String, frame: Vec<u8> },
    SidebarPtyTick,
    SidebarPtyFlush { session_name: String },
    SidebarPtyStopped { session_name: String },
    SidebarPtyRestart { session_name: String },
    ScriptOutput { workspace_id: String, kind: ScriptKind, line: String },
    FileWatcherEvent { path: PathBuf },
    StateWatcherEvent { workspace_id: String },
    Toast { message: String },
    Error { context: String, message: String },
    Shutdown,
}

const BUS_CAPACITY: usize = 1024;

/// Cloneable producer half of the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Create the bus: many producers, exactly one consumer.
pub fn bus() -> (EventBus, Receiver<Event>) {
    let (tx, rx) = bounded(BUS_CAPACITY);
    (
        EventBus {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl EventBus {
    /// Publish without ever blocking. A full bus drops the event and
    /// counts it; a disconnected bus means the consumer is gone (shutdown)
    /// and the event is discarded quietly.
    pub fn publish(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped_total = total, event = ?event, "bus full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("bus consumer gone, discarding event");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A bus with no consumer, for callers that run headless.
    pub fn detached() -> EventBus {
        bus().0
    }
}

/// Cancellation handle cloned into every background task. The token trips
/// when the owning supervisor drops its side of the channel.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for at most `timeout`; returns true when cancelled.
    pub fn cancelled_within(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        )
    }

    /// A token that never cancels, for tests and one-shot CLI calls.
    pub fn never() -> Self {
        static NEVER: OnceLock<(Sender<()>, Receiver<()>)> = OnceLock::new();
        let (_, rx) = NEVER.get_or_init(|| bounded(0));
        Self { rx: rx.clone() }
    }
}

/// Named registry of background threads. Every spawned task holds a
/// `CancelToken`; `shutdown` trips the token and joins everything, so no
/// task outlives the supervisor unobserved.
pub struct TaskSupervisor {
    name: String,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskSupervisor {
    pub fn new(name: impl Into<String>) -> Self {
        let (stop_tx, stop_rx) = bounded(0);
        Self {
            name: name.into(),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            rx: self.stop_rx.clone(),
        }
    }

    /// Spawn a named task. The closure receives the cancellation token and
    /// must exit promptly once it trips.
    pub fn spawn<F>(&self, task_name: impl Into<String>, f: F)
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let token = self.cancel_token();
        let task_name = task_name.into();
        match std::thread::Builder::new()
            .name(format!("{}:{task_name}", self.name))
            .spawn(move || f(token))
        {
            Ok(handle) => self
                .handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((task_name, handle)),
            Err(e) => warn!(supervisor = %self.name, task = %task_name, error = %e, "spawn failed"),
        }
    }

    /// Spawn a self-restarting timer firing `f` every `every`, exiting
    /// within one tick of cancellation.
    pub fn spawn_ticker<F>(&self, task_name: impl Into<String>, every: Duration, mut f: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.spawn(task_name, move |token| {
            let ticker = tick(every);
            loop {
                select! {
                    recv(ticker) -> _ => f(),
                    recv(token.rx) -> _ => break,
                }
            }
        });
    }

    /// Trip every cancellation token and join all tasks.
    pub fn shutdown(&self) {
        drop(
            self.stop_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for (task_name, handle) in handles {
            if handle.join().is_err() {
                warn!(supervisor = %self.name, task = %task_name, "task panicked");
            }
        }
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_and_receive() {
        let (bus, rx) = bus();
        bus.publish(Event::Toast {
            message: "hi".into(),
        });
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Event::Toast { message } => assert_eq!(message, "hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn full_bus_drops_instead_of_blocking() {
        let (bus, _rx) = bus();
        for _ in 0..(BUS_CAPACITY + 10) {
            bus.publish(Event::SidebarPtyTick);
        }
        assert_eq!(bus.dropped(), 10);
    }

    #[test]
    fn disconnected_bus_is_silent() {
        let (bus, rx) = bus();
        drop(rx);
        bus.publish(Event::SidebarPtyTick);
        assert_eq!(bus.dropped(), 0);
    }

    #[test]
    fn cancel_token_trips_on_shutdown() {
        let supervisor = TaskSupervisor::new("test");
        let token = supervisor.cancel_token();
        assert!(!token.is_cancelled());
        supervisor.shutdown();
        assert!(token.is_cancelled());
    }

    #[test]
    fn ticker_fires_and_stops_within_one_tick() {
        let supervisor = TaskSupervisor::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        supervisor.spawn_ticker("tick", Duration::from_millis(5), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(40));
        supervisor.shutdown();
        let at_shutdown = count.load(Ordering::SeqCst);
        assert!(at_shutdown >= 2, "ticker never fired");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), at_shutdown);
    }

    #[test]
    fn spawned_tasks_observe_cancellation_quickly() {
        let supervisor = TaskSupervisor::new("test");
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&finished);
        supervisor.spawn("worker", move |token| {
            while !token.cancelled_within(Duration::from_millis(5)) {}
            flag.store(1, Ordering::SeqCst);
        });
        supervisor.shutdown();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_token_stays_live() {
        assert!(!CancelToken::never().is_cancelled());
    }
}
