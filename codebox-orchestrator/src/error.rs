use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid value '{value}' for field '{field}'")]
    InvalidField { field: &'static str, value: String },

    #[error(transparent)]
    Config(#[from] codebox_config::ConfigError),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] codebox_runtime::RuntimeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub(crate) fn invalid_field(field: &'static str, value: impl ToString) -> Self {
        OrchestratorError::InvalidField {
            field,
            value: value.to_string(),
        }
    }
}

impl From<codebox_config::ConfigParseError> for OrchestratorError {
    fn from(e: codebox_config::ConfigParseError) -> Self {
        OrchestratorError::Config(e.into())
    }
}

impl From<tokio::task::JoinError> for OrchestratorError {
    fn from(e: tokio::task::JoinError) -> Self {
        OrchestratorError::Internal(format!("worker task failed: {e}"))
    }
}
