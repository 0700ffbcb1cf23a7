//! Error types for configuration retrieval and parsing.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Retrieval(#[from] ConfigRetrievalError),

    #[error(transparent)]
    Parse(#[from] ConfigParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while getting the configuration folder out of the Git source.
#[derive(Error, Debug)]
pub enum ConfigRetrievalError {
    #[error("Failed to clone remote repository: {0}")]
    HttpsClone(String),

    #[error("Failed to clone remote repository over SSH, has the deploy key been registered with the Git host? {0}")]
    SshAuthentication(String),

    #[error("Configuration folder {path} {reason}")]
    MissingConfigFolder { path: PathBuf, reason: String },

    #[error("Cannot archive configuration files: {0}")]
    Archive(String),

    #[error("Repository clone was cancelled")]
    Cancelled,

    #[error("Repository clone timed out after {0} seconds")]
    TimedOut(u64),
}

/// Failures while reading the devcontainer descriptor or compose document.
#[derive(Error, Debug)]
pub enum ConfigParseError {
    #[error("Devcontainer descriptor {0} is missing or unreadable")]
    MissingDescriptor(PathBuf),

    #[error("Invalid syntax in {file}: {message}")]
    InvalidSyntax { file: PathBuf, message: String },

    #[error("Docker compose file {0} not found")]
    MissingComposeFile(PathBuf),

    #[error("Service with name '{0}' doesn't exist in docker compose file")]
    UnknownService(String),

    #[error("'{0}': this devcontainer.json key is not allowed")]
    DeniedKey(String),

    #[error("Missing required key '{0}' in devcontainer.json")]
    MissingKey(&'static str),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigParseError {
    pub(crate) fn syntax(file: impl Into<PathBuf>, message: impl ToString) -> Self {
        ConfigParseError::InvalidSyntax {
            file: file.into(),
            message: message.to_string(),
        }
    }
}
