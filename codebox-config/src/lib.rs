//! Workspace configuration resolution.
//!
//! Fetches a workspace's configuration folder from its Git repository, keeps
//! it as a compressed archive, and turns the devcontainer descriptor (plus an
//! optional compose document) into something the lifecycle manager can run.

pub mod archive;
pub mod compose;
pub mod devcontainer;
pub mod error;
pub mod git;
pub mod jsonc;
pub mod resolver;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use compose::ComposeDocument;
pub use devcontainer::{DevcontainerConfig, DEFAULT_REMOTE_USER, DEFAULT_WORKSPACE_FOLDER};
pub use error::{ConfigError, ConfigParseError, ConfigRetrievalError, Result};
pub use git::{CancelFlag, Git2Fetcher, GitAuth, GitFetcher, GitSource, ProgressSink};
pub use resolver::{ConfigResolver, ResolveRequest, ResolvedConfig, ResolverSettings};
