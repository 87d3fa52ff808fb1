use std::path::PathBuf;
use std::process::{Command, Output};

use tracing::{debug, trace};

use crate::error::CoreError;

/// Builder for the external commands the core shells out to (git, tmux).
///
/// Failures carry the program name, exit code, and stderr so callers can
/// surface them as `CoreError::External` without re-parsing output.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn_output(&self) -> Result<Output, CoreError> {
        trace!(program = %self.program, args = ?self.args, workdir = ?self.workdir, "cmd start");
        self.build().output().map_err(|e| CoreError::External {
            program: self.program.clone(),
            code: None,
            stderr: format!("failed to execute: {e}"),
        })
    }

    /// Run, requiring a zero exit code.
    pub fn run(self) -> Result<Output, CoreError> {
        let output = self.spawn_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(
                program = %self.program,
                args = ?self.args,
                code = ?output.status.code(),
                stderr = %stderr,
                "cmd failure"
            );
            return Err(CoreError::External {
                program: self.program,
                code: output.status.code(),
                stderr,
            });
        }
        trace!(program = %self.program, "cmd success");
        Ok(output)
    }

    /// Run and return trimmed stdout.
    pub fn run_and_capture_stdout(self) -> Result<String, CoreError> {
        let output = self.run()?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run as a predicate: `Ok(true)` on exit 0, `Ok(false)` on any
    /// non-zero exit. Only a failure to spawn is an error.
    pub fn run_as_check(self) -> Result<bool, CoreError> {
        let output = self.spawn_output()?;
        let success = output.status.success();
        trace!(program = %self.program, success, "cmd check");
        Ok(success)
    }

}
