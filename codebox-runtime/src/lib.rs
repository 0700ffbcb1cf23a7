//! Container engine contract used by the workspace lifecycle.
//!
//! [`ContainerRuntime`] is narrow: create and start, exec, copy a file in,
//! enumerate published host ports, stop and remove. All calls block and are
//! made from lifecycle workers only.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub mod command;
pub mod docker;
pub mod error;
pub mod ports;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use ports::{PortRange, AGENT_PORT_RANGE};

/// Port the in-container agent listens on.
pub const AGENT_CONTAINER_PORT: u16 = 55088;

/// Label carrying the owning workspace id on every container we create.
pub const WORKSPACE_LABEL: &str = "com.codebox.workspace_id";

/// Label docker compose puts on volumes and containers of a project.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSpec {
    /// Image reference pulled on demand.
    Pull(String),
    /// Built locally and tagged before the container is created.
    Build {
        dockerfile: PathBuf,
        context: PathBuf,
        tag: String,
    },
}

/// A single development container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Engine-level container name.
    pub name: String,
    /// Name the container is known by inside the workspace.
    pub logical_name: String,
    pub image: ImageSpec,
    /// Named volume mounted at `workspace_folder`.
    pub workspace_volume: String,
    pub workspace_folder: String,
    pub env: BTreeMap<String, String>,
    pub agent_host_port: u16,
    pub labels: Vec<(String, String)>,
}

/// A compose stack, already rewritten for the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeSpec {
    pub project: String,
    pub file: PathBuf,
    /// Host port published for each service's agent.
    pub agent_ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeSpec {
    Container(ContainerSpec),
    Compose(ComposeSpec),
}

/// A started container as seen by the rest of the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    /// Logical name: `"development"` for single container workspaces, the
    /// service name for compose stacks.
    pub name: String,
    /// Address the container's ports are reachable on from this host.
    pub address: String,
    pub agent_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
    /// Return as soon as the process is launched, without collecting output.
    pub detached: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` for detached executions.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }

    /// Both streams, stdout first, for writing into a workspace log.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub compose_project: Option<String>,
}

/// The container engine, as far as workspaces need it.
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates and starts the containers described by `spec`.
    fn create_and_start(&self, spec: &RuntimeSpec) -> Result<Vec<ContainerHandle>>;

    fn exec(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        options: &ExecOptions,
    ) -> Result<ExecOutput>;

    /// Writes `content` to `dest` inside the container.
    fn copy_file(&self, handle: &ContainerHandle, dest: &Path, content: &[u8]) -> Result<()>;

    /// Host ports published by any container, running or not.
    fn list_used_host_ports(&self) -> Result<BTreeSet<u16>>;

    fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    /// Force-removes the container with engine-level name `name`, whatever
    /// its state. [`RuntimeError::NotFound`] when there is none.
    fn remove_by_name(&self, name: &str) -> Result<()>;

    /// Tears down a compose project: its containers and the networks it
    /// created. Succeeds when the project does not exist.
    fn remove_project(&self, project: &str) -> Result<()>;

    fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    fn remove_volume(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        assert!(ExecOutput::default().success());
        let failed = ExecOutput {
            exit_code: Some(2),
            stdout: "partial\n".to_string(),
            stderr: "mkdir: permission denied\n".to_string(),
        };
        assert!(!failed.success());
        assert_eq!(failed.combined(), "partial\nmkdir: permission denied");
    }
}
