//! Script execution with process-group supervision.
//!
//! Every script runs in its own process group so `stop` can terminate the
//! whole tree: SIGTERM, a grace period, then SIGKILL for stragglers.
//! "Process already gone" outcomes are benign races and map to success.
//! On Windows only the leader process is signalled and children may leak.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use super::{ProjectScripts, ScriptKind, resolve_command, resolve_setup, script_env};
use crate::error::CoreError;
use crate::events::{CancelToken, Event, EventBus, TaskSupervisor};
use crate::paths;
use crate::ports::PortAllocator;
use crate::workspace::{ScriptMode, Workspace};

/// Signal level passed to the kill function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Kill,
}

/// Kills a whole process group (or, on Windows, its leader). Injected so
/// tests can simulate kill races without real processes.
pub type KillFn = dyn Fn(u32, StopSignal) -> io::Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Grace period between SIGTERM and SIGKILL. Clamped to >= 50ms.
    pub grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(200),
        }
    }
}

struct RunningScript {
    pid: u32,
    kind: ScriptKind,
    done: Arc<AtomicBool>,
}

pub struct ScriptRunner {
    grace: Duration,
    running: Arc<Mutex<HashMap<String, Vec<RunningScript>>>>,
    killer: Arc<KillFn>,
    bus: EventBus,
    ports: Arc<PortAllocator>,
    tasks: TaskSupervisor,
}

impl ScriptRunner {
    pub fn new(config: RunnerConfig, bus: EventBus, ports: Arc<PortAllocator>) -> Self {
        Self::with_killer(config, bus, ports, default_killer())
    }

    pub fn with_killer(
        config: RunnerConfig,
        bus: EventBus,
        ports: Arc<PortAllocator>,
        killer: Box<KillFn>,
    ) -> Self {
        Self {
            grace: config.grace.max(Duration::from_millis(50)),
            running: Arc::new(Mutex::new(HashMap::new())),
            killer: Arc::from(killer),
            bus,
            ports,
            tasks: TaskSupervisor::new("script-runner"),
        }
    }

    fn slot_key(workspace: &Workspace) -> String {
        paths::normalize(&workspace.root)
    }

    /// Is any script currently running for this workspace?
    pub fn is_running(&self, workspace: &Workspace) -> bool {
        let key = Self::slot_key(workspace);
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Start the script of `kind` for a workspace. In nonconcurrent mode
    /// the previous run is stopped first; a non-benign stop failure fails
    /// this call and leaves the previous run alone.
    pub fn run_script(
        &self,
        workspace: &Workspace,
        kind: ScriptKind,
        project: &ProjectScripts,
    ) -> Result<(), CoreError> {
        let command = resolve_command(kind, project, workspace).ok_or_else(|| {
            CoreError::NotFound(format!("no {kind} script configured for {}", workspace.name))
        })?;

        if workspace.script_mode == ScriptMode::Nonconcurrent {
            self.stop(workspace)?;
        }

        let key = Self::slot_key(workspace);
        let workspace_id = workspace.id();
        let mut child = self.spawn_script(workspace, &command)?;
        let pid = child.id();
        info!(workspace = %workspace.name, %kind, pid, command = %command, "script started");

        let done = Arc::new(AtomicBool::new(false));
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .push(RunningScript {
                pid,
                kind,
                done: Arc::clone(&done),
            });

        self.spawn_output_readers(&mut child, &workspace_id, kind);

        // Background waiter: its only job is to reap the child and clear
        // the running slot.
        let running = Arc::clone(&self.running);
        let bus = self.bus.clone();
        self.tasks.spawn(format!("wait:{key}:{pid}"), move |token| {
            loop {
                match child.wait_timeout(Duration::from_millis(100)) {
                    Ok(Some(status)) => {
                        debug!(pid, code = ?status.code(), "script exited");
                        if !status.success() {
                            bus.publish(Event::ScriptOutput {
                                workspace_id: workspace_id.clone(),
                                kind,
                                line: format!(
                                    "[amux] {kind} script exited with code {}",
                                    status.code().unwrap_or(-1)
                                ),
                            });
                        }
                        break;
                    }
                    Ok(None) => {
                        if token.is_cancelled() {
                            debug!(pid, "abandoning wait during shutdown");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(pid, error = %e, "wait failed");
                        bus.publish(Event::Error {
                            context: format!("waiting for {kind} script"),
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
            done.store(true, Ordering::SeqCst);
            let mut map = running.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entries) = map.get_mut(&key) {
                entries.retain(|entry| entry.pid != pid);
                if entries.is_empty() {
                    map.remove(&key);
                }
            }
        });

        Ok(())
    }

    /// Run the ordered setup commands, stopping at the first failure with
    /// its stderr and exit diagnostics. Cancellation kills the current
    /// command's process group and returns `Shutdown`.
    pub fn run_setup(
        &self,
        workspace: &Workspace,
        project: &ProjectScripts,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        for command in resolve_setup(project, workspace) {
            self.run_setup_command(workspace, &command, cancel)?;
        }
        Ok(())
    }

    fn run_setup_command(
        &self,
        workspace: &Workspace,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        let mut child = self.spawn_script(workspace, command)?;
        let pid = child.id();
        debug!(workspace = %workspace.name, pid, command, "setup command started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        std::thread::scope(|scope| {
            let stdout_buf = scope.spawn(move || read_all(stdout));
            let stderr_buf = scope.spawn(move || read_all(stderr));

            let status = loop {
                match child.wait_timeout(Duration::from_millis(100)) {
                    Ok(Some(status)) => break status,
                    Ok(None) => {
                        if cancel.is_cancelled() {
                            let _ = (self.killer)(pid, StopSignal::Kill);
                            let _ = child.wait();
                            return Err(CoreError::Shutdown);
                        }
                    }
                    Err(e) => return Err(CoreError::Io(e)),
                }
            };

            let stdout_text = stdout_buf.join().unwrap_or_default();
            let stderr_text = stderr_buf.join().unwrap_or_default();
            self.publish_lines(&workspace.id(), ScriptKind::Setup, &stdout_text);

            if status.success() {
                Ok(())
            } else {
                Err(CoreError::External {
                    program: command.to_string(),
                    code: status.code(),
                    stderr: stderr_text.trim().to_string(),
                })
            }
        })
    }

    /// Terminate everything running for a workspace: SIGTERM the group,
    /// wait the grace period, SIGKILL what remains. Benign races ("process
    /// already finished", "no such process", ESRCH, ECHILD) are success.
    pub fn stop(&self, workspace: &Workspace) -> Result<(), CoreError> {
        let key = Self::slot_key(workspace);
        let entries = {
            let mut map = self.running.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&key)
        };
        let Some(mut entries) = entries else {
            return Ok(());
        };

        while let Some(entry) = entries.first() {
            if let Err(e) = self.stop_one(entry) {
                // Put the unstopped entries back so the state still
                // reflects reality, then propagate.
                let mut map = self.running.lock().unwrap_or_else(|e| e.into_inner());
                map.entry(key.clone()).or_default().append(&mut entries);
                return Err(e);
            }
            entries.remove(0);
        }
        Ok(())
    }

    fn stop_one(&self, entry: &RunningScript) -> Result<(), CoreError> {
        debug!(pid = entry.pid, kind = %entry.kind, "stopping script");
        match (self.killer)(entry.pid, StopSignal::Term) {
            Ok(()) => {}
            Err(e) if is_benign_kill_error(&e) => {
                debug!(pid = entry.pid, error = %e, "term race, treating as stopped");
                return Ok(());
            }
            Err(e) => {
                return Err(CoreError::External {
                    program: "kill".into(),
                    code: e.raw_os_error(),
                    stderr: e.to_string(),
                });
            }
        }

        // Grace period: the waiter thread flips `done` once the child is
        // reaped.
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if entry.done.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        match (self.killer)(entry.pid, StopSignal::Kill) {
            Ok(()) => Ok(()),
            Err(e) if is_benign_kill_error(&e) => Ok(()),
            Err(e) => Err(CoreError::External {
                program: "kill".into(),
                code: e.raw_os_error(),
                stderr: e.to_string(),
            }),
        }
    }

    /// Best-effort stop of every running script, for shutdown.
    pub fn stop_all(&self) {
        let keys: Vec<String> = {
            let map = self.running.lock().unwrap_or_else(|e| e.into_inner());
            map.keys().cloned().collect()
        };
        for key in keys {
            let entries = {
                let mut map = self.running.lock().unwrap_or_else(|e| e.into_inner());
                map.remove(&key)
            };
            for entry in entries.unwrap_or_default() {
                if let Err(e) = self.stop_one(&entry) {
                    warn!(pid = entry.pid, error = %e, "stop_all: script would not die");
                }
            }
        }
    }

    /// Stop everything and join background waiters.
    pub fn shutdown(&self) {
        self.stop_all();
        self.tasks.shutdown();
    }

    fn spawn_script(&self, workspace: &Workspace, command: &str) -> Result<Child, CoreError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&workspace.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in script_env(workspace, &self.ports) {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Fresh process group: the whole script tree is one kill target.
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|e| CoreError::External {
            program: "sh".into(),
            code: None,
            stderr: format!("failed to start `{command}`: {e}"),
        })
    }

    fn spawn_output_readers(&self, child: &mut Child, workspace_id: &str, kind: ScriptKind) {
        if let Some(stdout) = child.stdout.take() {
            let bus = self.bus.clone();
            let workspace_id = workspace_id.to_string();
            self.tasks.spawn(format!("stdout:{workspace_id}"), move |_| {
                publish_stream(&bus, &workspace_id, kind, stdout);
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let bus = self.bus.clone();
            let workspace_id = workspace_id.to_string();
            self.tasks.spawn(format!("stderr:{workspace_id}"), move |_| {
                publish_stream(&bus, &workspace_id, kind, stderr);
            });
        }
    }

    fn publish_lines(&self, workspace_id: &str, kind: ScriptKind, text: &str) {
        for line in text.lines() {
            self.bus.publish(Event::ScriptOutput {
                workspace_id: workspace_id.to_string(),
                kind,
                line: line.to_string(),
            });
        }
    }
}

fn publish_stream(bus: &EventBus, workspace_id: &str, kind: ScriptKind, stream: impl Read) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        match line {
            Ok(line) => bus.publish(Event::ScriptOutput {
                workspace_id: workspace_id.to_string(),
                kind,
                line,
            }),
            Err(_) => break,
        }
    }
}

fn read_all(stream: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_string(&mut buf);
    }
    buf
}

/// Benign stop races: the process (or its group) is already gone.
pub fn is_benign_kill_error(err: &io::Error) -> bool {
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error()
        && (code == nix::errno::Errno::ESRCH as i32 || code == nix::errno::Errno::ECHILD as i32)
    {
        return true;
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("process already finished") || msg.contains("no such process")
}

#[cfg(unix)]
fn default_killer() -> Box<KillFn> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    Box::new(|pid, signal| {
        let sig = match signal {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        killpg(Pid::from_raw(pid as i32), sig)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
    })
}

#[cfg(windows)]
fn default_killer() -> Box<KillFn> {
    // Leader-only: Windows has no process groups in the POSIX sense, so
    // children of the script may leak.
    Box::new(|pid, _signal| {
        let output = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    })
}
