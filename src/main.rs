mod cli;
mod cmd;
mod diag;
mod discovery;
mod error;
mod events;
mod fsutil;
mod git;
mod lockfile;
mod logger;
mod paths;
mod ports;
mod registry;
mod scripts;
mod session;
mod workspace;

use std::process::ExitCode;

use tracing::{error, info};

fn main() -> ExitCode {
    if let Err(e) = logger::init() {
        eprintln!("warning: logging disabled: {e}");
    }
    info!(args = ?std::env::args().collect::<Vec<_>>(), "amux start");

    let code = cli::run();
    if code == 0 {
        info!("amux finished successfully");
    } else {
        error!(code, "amux failed");
    }
    ExitCode::from(code)
}
