//! PTY attachment and the per-tab reader/coalescer pair.
//!
//! Each active tab owns one PTY running `tmux attach-session`. The reader
//! thread moves raw bytes off the PTY as fast as the kernel hands them
//! over; the coalescer batches them into frames for the UI no more often
//! than the frame budget, holding overflow in a bounded ring buffer.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, trace};

use super::screen::{RingBuffer, ScreenFilter};
use crate::error::CoreError;
use crate::events::{Event, EventBus};

fn pty_err(e: anyhow::Error) -> CoreError {
    CoreError::External {
        program: "pty".into(),
        code: None,
        stderr: e.to_string(),
    }
}

/// Everything the supervisor needs to drive one attached session.
pub struct AttachedPty {
    pub master: Box<dyn MasterPty + Send>,
    pub writer: Box<dyn std::io::Write + Send>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// Open a PTY and run `tmux attach-session` inside it.
pub fn attach(session_name: &str, rows: u16, cols: u16) -> Result<AttachedPty, CoreError> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(pty_err)?;

    let mut cmd = CommandBuilder::new("tmux");
    cmd.args(["attach-session", "-t", &format!("={session_name}")]);
    let child = pair.slave.spawn_command(cmd).map_err(pty_err)?;
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().map_err(pty_err)?;
    let writer = pair.master.take_writer().map_err(pty_err)?;
    let killer = child.clone_killer();
    debug!(session = %session_name, "pty attached");

    Ok(AttachedPty {
        master: pair.master,
        writer,
        killer,
        reader,
        child,
    })
}

pub fn resize(master: &dyn MasterPty, rows: u16, cols: u16) -> Result<(), CoreError> {
    master
        .resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(pty_err)
}

/// Reader loop: pull bytes off the PTY until EOF, stop flag, or a dead
/// coalescer. Progress and liveness feed the watchdog.
pub fn run_reader(
    mut reader: Box<dyn Read + Send>,
    tx: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 8192];
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                progress.fetch_add(n as u64, Ordering::SeqCst);
                trace!(bytes = n, "pty read");
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(error = %e, "pty read failed");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    // Dropping `tx` disconnects the coalescer, which flushes and stops.
}

/// Coalescer loop: batch chunks into frames no more often than
/// `frame_budget`, bounded by `ring_capacity`. Publishes the final flush
/// and a stopped marker when the reader goes away.
pub fn run_coalescer(
    rx: Receiver<Vec<u8>>,
    bus: EventBus,
    session_name: String,
    frame_budget: Duration,
    ring_capacity: usize,
) {
    let mut ring = RingBuffer::new(ring_capacity);
    let mut filter = ScreenFilter::new();
    let mut last_flush = Instant::now();

    loop {
        let timeout = if ring.is_empty() {
            frame_budget
        } else {
            frame_budget
                .saturating_sub(last_flush.elapsed())
                .max(Duration::from_millis(1))
        };

        match rx.recv_timeout(timeout) {
            Ok(chunk) => {
                let filtered = filter.filter(&chunk);
                ring.push(&filtered);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if !ring.is_empty() {
                    bus.publish(Event::SidebarPtyOutput {
                        session_name: session_name.clone(),
                        frame: ring.drain(),
                    });
                }
                bus.publish(Event::SidebarPtyFlush {
                    session_name: session_name.clone(),
                });
                bus.publish(Event::SidebarPtyStopped { session_name });
                return;
            }
        }

        if !ring.is_empty() && last_flush.elapsed() >= frame_budget {
            bus.publish(Event::SidebarPtyOutput {
                session_name: session_name.clone(),
                frame: ring.drain(),
            });
            last_flush = Instant::now();
        }
    }
}
