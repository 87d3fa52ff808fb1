use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize tracing to a non-blocking file appender under the state dir.
/// Safe to call more than once; later calls are no-ops.
pub fn init() -> Result<()> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let dir = state_dir()?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory at {}", dir.display()))?;

    let file_appender = rolling::never(&dir, "amux.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// State directory for logs: `$XDG_STATE_HOME/amux`, falling back to
/// `~/.local/state/amux`, then the current directory.
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME")
        && !state_home.is_empty()
    {
        return Ok(PathBuf::from(state_home).join("amux"));
    }

    if let Some(home_dir) = home::home_dir() {
        return Ok(home_dir.join(".local").join("state").join("amux"));
    }

    Ok(std::env::current_dir()?.join(".amux-state"))
}
