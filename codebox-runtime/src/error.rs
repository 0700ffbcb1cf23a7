//! Error types for container engine operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected container engine output: {0}")]
    UnexpectedOutput(String),

    #[error("No free host port available in {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Container or volume not found: {0}")]
    NotFound(String),
}

impl RuntimeError {
    pub(crate) fn failed(command: impl Into<String>, stderr: impl AsRef<str>) -> Self {
        let command = command.into();
        let stderr = stderr.as_ref().trim().to_string();
        if stderr.contains("No such container") || stderr.contains("no such volume") {
            RuntimeError::NotFound(stderr)
        } else {
            RuntimeError::CommandFailed { command, stderr }
        }
    }
}
