//! Docker command builder.
//!
//! Every engine call goes through [`DockerCommand`] so that logging, error
//! mapping and argument handling stay consistent.

use crate::error::{Result, RuntimeError};
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DockerCommand {
    program: String,
    subcommand: Vec<String>,
    args: Vec<String>,
}

impl DockerCommand {
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    /// Uses another CLI binary with a docker compatible interface.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            subcommand: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Sets the subcommand, e.g. `"ps"` or `"compose"`.
    pub fn subcommand<S: Into<String>>(mut self, cmd: S) -> Self {
        self.subcommand.push(cmd.into());
        self
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
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

    /// Appends `flag value` only when `value` is present.
    pub fn opt<S: Into<String>>(self, flag: &str, value: Option<S>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value),
            None => self,
        }
    }

    fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.subcommand.iter().cloned());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.subcommand);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Runs the command, failing on a non-zero exit status.
    pub fn execute(self) -> Result<()> {
        self.execute_with_output().map(|_| ())
    }

    /// Runs the command and returns its stdout.
    pub fn execute_with_output(self) -> Result<String> {
        let output = self.execute_raw()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(command = %self.display(), status = %output.status, "docker command failed");
            Err(RuntimeError::failed(self.display(), stderr))
        }
    }

    /// Runs the command and hands back the raw output, whatever the exit status.
    pub fn execute_raw(&self) -> Result<Output> {
        debug!(command = %self.display(), "executing docker command");
        Ok(self.build_command().output()?)
    }
}

impl Default for DockerCommand {
    fn default() -> Self {
        Self::new()
    }
}
