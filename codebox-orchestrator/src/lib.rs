//! Workspace orchestration business logic
//!
//! This crate drives hosted workspaces through their lifecycle, persists
//! them, and keeps the in-memory endpoint registry the port-forwarding
//! router reads. It is consumed by the codebox-api service but can also be
//! used by CLI commands, background workers, or other entry points.

pub mod db;
pub mod devcontainer;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod registry;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use driver::{OperationContext, WorkspaceDriver};
pub use error::{OrchestratorError, Result};
pub use lifecycle::{LifecycleManager, LifecycleOp, OrchestratorSettings};
pub use models::{
    AgentStatus, ConnectionType, ContainerStatus, ContainerType, CreateWorkspaceRequest,
    ForwardedPort, LogEntry, User, Workspace, WorkspaceContainer, WorkspaceKind, WorkspaceStatus,
};
pub use registry::{Endpoint, EndpointRegistry};
pub use store::WorkspaceStore;
