//! Persisted records and their enumerated fields.
//!
//! Enum columns are stored as lowercase text. Reading one back goes through
//! [`parse_field`], which names the offending column on failure.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

pub(crate) fn parse_field<T: DeserializeOwned>(field: &'static str, value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| OrchestratorError::invalid_field(field, value))
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

text_enum!(WorkspaceStatus {
    Creating => "creating",
    Starting => "starting",
    Running => "running",
    Stopping => "stopping",
    Stopped => "stopped",
    Error => "error",
});

/// Workspace flavours. Each one brings its own lifecycle driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Devcontainer,
}

text_enum!(WorkspaceKind {
    Devcontainer => "devcontainer",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    DockerContainer,
}

text_enum!(ContainerType {
    DockerContainer => "docker_container",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

text_enum!(ContainerStatus {
    Starting => "starting",
    Running => "running",
    Stopped => "stopped",
    Error => "error",
});

/// Liveness of the in-container agent, tracked apart from the container itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Running,
    Error,
}

text_enum!(AgentStatus {
    Starting => "starting",
    Running => "running",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Http,
    Ws,
}

text_enum!(ConnectionType {
    Http => "http",
    Ws => "ws",
});

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub ssh_private_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub kind: WorkspaceKind,
    pub status: WorkspaceStatus,
    pub git_repo_url: String,
    pub git_repo_config_folder: String,
    pub git_branch: Option<String>,
    /// Cached configuration archive; set once configuration was resolved.
    pub config_archive: Option<String>,
    /// Type specific settings, opaque to the lifecycle.
    pub custom_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_on: Option<DateTime<Utc>>,
    pub last_start_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    pub user_id: i64,
    #[serde(default = "default_kind")]
    pub kind: WorkspaceKind,
    pub git_repo_url: String,
    #[serde(default = "default_config_folder")]
    pub git_repo_config_folder: String,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub custom_config: Option<serde_json::Value>,
}

fn default_kind() -> WorkspaceKind {
    WorkspaceKind::Devcontainer
}

fn default_config_folder() -> String {
    ".devcontainer".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceContainer {
    pub id: i64,
    pub workspace_id: i64,
    /// Engine id of the running container.
    pub container_id: String,
    pub container_type: ContainerType,
    pub name: String,
    pub container_user: String,
    pub container_status: ContainerStatus,
    pub agent_status: AgentStatus,
    pub agent_external_port: u16,
    pub agent_last_contact: Option<DateTime<Utc>>,
    pub can_connect_remote_developing: bool,
    pub workspace_path_in_container: String,
    pub external_ipv4: String,
    pub forwarded_ports: Vec<ForwardedPort>,
}

/// Container fields written by the lifecycle after a successful start.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub container_id: String,
    pub container_type: ContainerType,
    pub name: String,
    pub container_user: String,
    pub container_status: ContainerStatus,
    pub agent_status: AgentStatus,
    pub agent_external_port: u16,
    pub can_connect_remote_developing: bool,
    pub workspace_path_in_container: String,
    pub external_ipv4: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardedPort {
    pub id: i64,
    pub container_id: i64,
    pub port_number: u16,
    pub active: bool,
    pub connection_type: ConnectionType,
    pub public: bool,
}

/// A port a container should publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequest {
    pub port_number: u16,
    pub connection_type: ConnectionType,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub logged_at: DateTime<Utc>,
    pub message: String,
}

pub(crate) fn port_number(field: &'static str, value: i64) -> Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| OrchestratorError::invalid_field(field, value))
}
