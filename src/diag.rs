//! Developer diagnostics driven by environment variables.
//!
//! `AMUX_PPROF` exposes a plaintext counters endpoint, `AMUX_DEBUG_SIGNALS`
//! wires SIGUSR1 to a state dump, `AMUX_PROFILE` /
//! `AMUX_PROFILE_INTERVAL_MS` control the periodic counters log line.

use std::io::Write;
use std::net::TcpListener;
use std::time::Duration;

use tracing::{info, warn};

use crate::events::{EventBus, TaskSupervisor};

const DEFAULT_PPROF_PORT: u16 = 6060;
const DEFAULT_PROFILE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PprofSetting {
    Off,
    Port(u16),
    Addr(String),
}

#[derive(Debug, Clone)]
pub struct DiagConfig {
    pub pprof: PprofSetting,
    pub debug_signals: bool,
    pub profile: bool,
    pub profile_interval: Duration,
}

impl DiagConfig {
    pub fn from_env() -> Self {
        Self {
            pprof: parse_pprof(std::env::var("AMUX_PPROF").ok().as_deref()),
            debug_signals: std::env::var("AMUX_DEBUG_SIGNALS")
                .map(|v| !v.is_empty())
                .unwrap_or(false),
            profile: parse_profile(std::env::var("AMUX_PROFILE").ok().as_deref()),
            profile_interval: parse_profile_interval(
                std::env::var("AMUX_PROFILE_INTERVAL_MS").ok().as_deref(),
            ),
        }
    }
}

fn parse_pprof(value: Option<&str>) -> PprofSetting {
    let Some(value) = value.map(str::trim) else {
        return PprofSetting::Off;
    };
    match value {
        "" | "off" | "0" | "false" => PprofSetting::Off,
        "1" | "true" => PprofSetting::Port(DEFAULT_PPROF_PORT),
        other => match other.parse::<u16>() {
            Ok(port) => PprofSetting::Port(port),
            Err(_) => PprofSetting::Addr(other.to_string()),
        },
    }
}

fn parse_profile(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        Some("0") | Some("false") | Some("no") => false,
        Some(_) => true,
        None => false,
    }
}

fn parse_profile_interval(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_PROFILE_INTERVAL)
}

/// Start whatever the diagnostics config asks for. All tasks register
/// under the caller's supervisor and stop with it.
pub fn start(config: &DiagConfig, bus: &EventBus, tasks: &TaskSupervisor) {
    if config.profile {
        let bus = bus.clone();
        tasks.spawn_ticker("profile", config.profile_interval, move || {
            info!(bus_dropped = bus.dropped(), "profile counters");
        });
    }

    #[cfg(unix)]
    if config.debug_signals {
        spawn_signal_dump(bus, tasks);
    }

    match &config.pprof {
        PprofSetting::Off => {}
        PprofSetting::Port(port) => spawn_counters_listener(format!("127.0.0.1:{port}"), bus, tasks),
        PprofSetting::Addr(addr) => spawn_counters_listener(addr.clone(), bus, tasks),
    }
}

#[cfg(unix)]
fn spawn_signal_dump(bus: &EventBus, tasks: &TaskSupervisor) {
    use signal_hook::consts::SIGUSR1;
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGUSR1]) {
        Ok(signals) => signals,
        Err(e) => {
            warn!(error = %e, "cannot install SIGUSR1 handler");
            return;
        }
    };
    let bus = bus.clone();
    tasks.spawn("sigusr1-dump", move |token| {
        while !token.cancelled_within(Duration::from_millis(200)) {
            for _ in signals.pending() {
                info!(bus_dropped = bus.dropped(), "SIGUSR1 state dump");
            }
        }
    });
}

/// Tiny plaintext endpoint in place of Go's pprof server: connect and read
/// the current counters snapshot.
fn spawn_counters_listener(addr: String, bus: &EventBus, tasks: &TaskSupervisor) {
    let listener = match TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %addr, error = %e, "cannot bind diagnostics listener");
            return;
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        warn!(error = %e, "cannot configure diagnostics listener");
        return;
    }
    info!(addr = %addr, "diagnostics listener up");

    let bus = bus.clone();
    tasks.spawn("pprof-listener", move |token| {
        loop {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let body = format!("amux counters\nbus_dropped: {}\n", bus.dropped());
                    let _ = stream.write_all(body.as_bytes());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if token.cancelled_within(Duration::from_millis(100)) {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "diagnostics accept failed");
                    return;
                }
            }
        }
    });
}
