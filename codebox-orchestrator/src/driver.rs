//! Per workspace-type behaviour behind the lifecycle manager.
//!
//! The lifecycle owns locking, status transitions, the endpoint registry and
//! failure capture. A driver only knows how to bring its kind of workspace up,
//! take it down and clean up after it.

use crate::devcontainer::DevcontainerDriver;
use crate::error::Result;
use crate::lifecycle::OrchestratorSettings;
use crate::models::{Workspace, WorkspaceContainer, WorkspaceKind};
use crate::store::WorkspaceStore;
use codebox_config::{CancelFlag, ConfigResolver};
use codebox_runtime::{ContainerHandle, ContainerRuntime};
use std::sync::Arc;

/// Everything a driver may touch while running one operation.
#[derive(Clone)]
pub struct OperationContext {
    pub workspace: Workspace,
    pub store: WorkspaceStore,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub resolver: Arc<ConfigResolver>,
    pub settings: Arc<OrchestratorSettings>,
    /// Raised when the operation should give up early.
    pub cancel: CancelFlag,
}

#[async_trait::async_trait]
pub trait WorkspaceDriver: Send + Sync {
    /// Brings the workspace's containers up and records them in the store.
    async fn start(&self, ctx: &OperationContext) -> Result<()>;

    /// Stops every container and deactivates their forwarded ports.
    async fn stop(&self, ctx: &OperationContext) -> Result<()>;

    /// Removes containers, volumes and cached configuration. The workspace
    /// record itself is removed by the caller.
    async fn delete(&self, ctx: &OperationContext) -> Result<()>;

    /// Drops cached configuration so the next start fetches it again.
    async fn refresh_config(&self, ctx: &OperationContext) -> Result<()>;
}

static DEVCONTAINER: DevcontainerDriver = DevcontainerDriver;

impl WorkspaceKind {
    pub fn driver(&self) -> &'static dyn WorkspaceDriver {
        match self {
            WorkspaceKind::Devcontainer => &DEVCONTAINER,
        }
    }
}

/// Rebuilds the runtime handle of a persisted container.
pub fn handle_of(container: &WorkspaceContainer) -> ContainerHandle {
    ContainerHandle {
        id: container.container_id.clone(),
        name: container.name.clone(),
        address: container.external_ipv4.clone(),
        agent_port: container.agent_external_port,
    }
}
