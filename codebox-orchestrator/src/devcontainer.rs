//! Driver for workspaces described by a `devcontainer.json`, either a single
//! container or a compose stack.

use crate::driver::{handle_of, OperationContext, WorkspaceDriver};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    AgentStatus, ConnectionType, ContainerStatus, ContainerType, NewContainer, PortRequest,
};
use codebox_config::compose::ComposeRewrite;
use codebox_config::devcontainer::{ImageSource, PortForward};
use codebox_config::{
    CancelFlag, ComposeDocument, ConfigRetrievalError, DevcontainerConfig, GitAuth, GitSource,
    ResolveRequest, ResolvedConfig,
};
use codebox_runtime::{
    ComposeSpec, ContainerHandle, ContainerRuntime, ContainerSpec, ExecOptions, ImageSpec,
    RuntimeError, RuntimeSpec, AGENT_CONTAINER_PORT, AGENT_PORT_RANGE, WORKSPACE_LABEL,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Logical name of the container in single container workspaces.
pub const DEVELOPMENT_CONTAINER: &str = "development";

/// SSH port served by the agent; always forwarded.
pub const AGENT_SSH_PORT: u16 = 2222;

pub const AGENT_INSTALL_DIR: &str = "/opt/codebox";
const AGENT_BINARY_NAME: &str = "agent.bin";

pub fn compose_project(prefix: &str, workspace_id: i64) -> String {
    format!("{prefix}_workspace_{workspace_id}")
}

pub fn container_name(prefix: &str, workspace_id: i64) -> String {
    format!("{prefix}-workspace-{workspace_id}")
}

/// Named volume backing the workspace folder.
pub fn volume_name(prefix: &str, workspace_name: &str, workspace_id: i64) -> String {
    let slug: String = workspace_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "workspace" } else { slug };
    format!("{prefix}-workspace-{slug}-{workspace_id}-data")
}

/// Ports published for `container`: its declared forwards as http, plus the
/// agent's SSH port as ws.
pub fn port_requests(declared: &[PortForward], container: &str, is_dev: bool) -> Vec<PortRequest> {
    let mut requests: Vec<PortRequest> = Vec::new();
    for forward in declared {
        let applies = match &forward.service {
            Some(service) => service == container,
            None => is_dev,
        };
        if applies && !requests.iter().any(|r| r.port_number == forward.port) {
            requests.push(PortRequest {
                port_number: forward.port,
                connection_type: ConnectionType::Http,
                public: true,
            });
        }
    }

    if !requests.iter().any(|r| r.port_number == AGENT_SSH_PORT) {
        requests.push(PortRequest {
            port_number: AGENT_SSH_PORT,
            connection_type: ConnectionType::Ws,
            public: true,
        });
    }
    requests
}

pub struct DevcontainerDriver;

#[async_trait::async_trait]
impl WorkspaceDriver for DevcontainerDriver {
    #[instrument(skip(self, ctx), fields(workspace_id = ctx.workspace.id))]
    async fn start(&self, ctx: &OperationContext) -> Result<()> {
        let ws = &ctx.workspace;
        let source = GitSource {
            url: ws.git_repo_url.clone(),
            config_folder: ws.git_repo_config_folder.clone(),
            branch: ws.git_branch.clone(),
        };
        let auth = if source.is_https() {
            GitAuth::None
        } else {
            match ctx.store.get_user(ws.user_id).await?.ssh_private_key {
                Some(private_key) => GitAuth::SshKey { private_key },
                None => GitAuth::None,
            }
        };

        let request = ResolveRequest {
            workspace_id: ws.id,
            source,
            auth,
            cached_archive: ws.config_archive.as_ref().map(PathBuf::from),
        };
        let resolved = resolve_config(ctx, request).await?;

        let stale = ctx
            .store
            .list_containers(ws.id)
            .await?
            .iter()
            .map(handle_of)
            .collect();

        let prefix = &ctx.settings.objects_prefix;
        let launch = Launch {
            workspace_id: ws.id,
            prefix: prefix.clone(),
            volume: volume_name(prefix, &ws.name, ws.id),
            resolved,
            agent_binary: ctx.settings.agent_binary.clone(),
            stale,
            runtime: ctx.runtime.clone(),
            cancel: ctx.cancel.clone(),
        };

        let launched = tokio::task::spawn_blocking(move || launch.run()).await??;

        for note in &launched.notes {
            ctx.store.append_log(ws.id, note).await?;
        }

        let agent_status = if launched.agent_installed {
            AgentStatus::Running
        } else {
            AgentStatus::Starting
        };

        for handle in &launched.handles {
            let is_dev = handle.name == launched.dev_container;
            let container = NewContainer {
                container_id: handle.id.clone(),
                container_type: ContainerType::DockerContainer,
                name: handle.name.clone(),
                container_user: if is_dev {
                    launched.remote_user.clone()
                } else {
                    codebox_config::DEFAULT_REMOTE_USER.to_string()
                },
                container_status: ContainerStatus::Running,
                agent_status,
                agent_external_port: handle.agent_port,
                can_connect_remote_developing: is_dev,
                workspace_path_in_container: launched.workspace_folder.clone(),
                external_ipv4: handle.address.clone(),
            };
            let row_id = ctx.store.upsert_container(ws.id, &container).await?;
            let ports = port_requests(&launched.forward_ports, &handle.name, is_dev);
            ctx.store.activate_ports(row_id, &ports).await?;
        }

        Ok(())
    }

    #[instrument(skip(self, ctx), fields(workspace_id = ctx.workspace.id))]
    async fn stop(&self, ctx: &OperationContext) -> Result<()> {
        let id = ctx.workspace.id;
        let handles: Vec<ContainerHandle> = ctx
            .store
            .list_containers(id)
            .await?
            .iter()
            .map(handle_of)
            .collect();

        let runtime = ctx.runtime.clone();
        tokio::task::spawn_blocking(move || {
            for handle in &handles {
                tolerate_missing(runtime.stop(handle))?;
            }
            Ok::<_, OrchestratorError>(())
        })
        .await??;

        ctx.store
            .set_containers_status(id, ContainerStatus::Stopped)
            .await?;
        ctx.store.deactivate_ports(id).await?;
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(workspace_id = ctx.workspace.id))]
    async fn delete(&self, ctx: &OperationContext) -> Result<()> {
        let ws = &ctx.workspace;
        let handles: Vec<ContainerHandle> = ctx
            .store
            .list_containers(ws.id)
            .await?
            .iter()
            .map(handle_of)
            .collect();

        let prefix = &ctx.settings.objects_prefix;
        let project = compose_project(prefix, ws.id);
        let volume = volume_name(prefix, &ws.name, ws.id);
        let runtime = ctx.runtime.clone();

        tokio::task::spawn_blocking(move || {
            for handle in &handles {
                tolerate_missing(runtime.remove(handle))?;
            }
            // A no-op for single container workspaces.
            if let Err(e) = runtime.remove_project(&project) {
                warn!(%project, error = %e, "could not remove compose project");
            }
            remove_volumes(runtime.as_ref(), &project, &volume);
            Ok::<_, OrchestratorError>(())
        })
        .await??;

        ctx.store.delete_containers(ws.id).await?;
        if let Some(archive) = &ws.config_archive {
            ctx.resolver.discard(Path::new(archive))?;
        }
        ctx.resolver
            .discard(&ctx.resolver.settings().archive_path(ws.id))?;
        ctx.store.clear_logs(ws.id).await?;
        Ok(())
    }

    async fn refresh_config(&self, ctx: &OperationContext) -> Result<()> {
        let ws = &ctx.workspace;
        if let Some(archive) = &ws.config_archive {
            ctx.resolver.discard(Path::new(archive))?;
        }
        ctx.store.set_config_archive(ws.id, None).await?;
        Ok(())
    }
}

/// Returns the workspace's configuration archive, fetching it when there is
/// none. A fresh archive is recorded on the workspace right away, so a start
/// that fails later does not clone again. Clone progress goes to the
/// workspace log while the fetch runs.
async fn resolve_config(
    ctx: &OperationContext,
    request: ResolveRequest,
) -> Result<ResolvedConfig> {
    let id = request.workspace_id;
    let url = request.source.url.clone();
    let resolver = ctx.resolver.clone();
    let cancel = ctx.cancel.clone();
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();

    let resolving = tokio::task::spawn_blocking(move || {
        let report = |line: &str| {
            let _ = progress_tx.send(line.to_string());
        };
        resolver.resolve_with_progress(&request, &cancel, &report)
    });

    // Ends once the blocking task drops the sender.
    while let Some(line) = progress_rx.recv().await {
        ctx.store.append_log(id, &line).await?;
    }
    let resolved = resolving.await??;

    if resolved.freshly_fetched {
        let archive = resolved.archive_path.to_string_lossy();
        ctx.store.set_config_archive(id, Some(&*archive)).await?;
        ctx.store
            .append_log(id, &format!("fetched configuration from {url}"))
            .await?;
    }
    Ok(resolved)
}

fn tolerate_missing(result: codebox_runtime::Result<()>) -> Result<()> {
    match result {
        Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Best effort: a volume that cannot be removed does not fail the delete.
fn remove_volumes(runtime: &dyn ContainerRuntime, project: &str, volume: &str) {
    let volumes = match runtime.list_volumes() {
        Ok(volumes) => volumes,
        Err(e) => {
            warn!(error = %e, "could not list volumes");
            return;
        }
    };

    for info in volumes {
        let owned = info.name == volume || info.compose_project.as_deref() == Some(project);
        if !owned {
            continue;
        }
        match runtime.remove_volume(&info.name) {
            Ok(()) => info!(volume = %info.name, "removed volume"),
            Err(e) => warn!(volume = %info.name, error = %e, "could not remove volume"),
        }
    }
}

/// The blocking half of a start: everything that touches Git, the disk or
/// the container engine.
struct Launch {
    workspace_id: i64,
    prefix: String,
    volume: String,
    resolved: ResolvedConfig,
    agent_binary: Option<PathBuf>,
    stale: Vec<ContainerHandle>,
    runtime: Arc<dyn ContainerRuntime>,
    cancel: CancelFlag,
}

struct Launched {
    handles: Vec<ContainerHandle>,
    dev_container: String,
    remote_user: String,
    workspace_folder: String,
    forward_ports: Vec<PortForward>,
    agent_installed: bool,
    notes: Vec<String>,
}

impl Launch {
    fn run(self) -> Result<Launched> {
        let mut notes = Vec::new();

        // Holds the extracted configuration, and the rewritten compose file,
        // until the containers are up.
        let working_dir = tempfile::Builder::new()
            .prefix(&format!("tmp_workspace_{}_", self.workspace_id))
            .tempdir()?;
        let mut config = self.resolved.materialize(working_dir.path())?;
        self.check_cancelled()?;

        for handle in &self.stale {
            tolerate_missing(self.runtime.remove(handle))?;
        }

        let workspace_folder = config.workspace_folder()?.to_string();
        let remote_user = config.remote_user()?.to_string();
        let forward_ports = config.forward_ports()?;
        let mut used = self.runtime.list_used_host_ports()?;

        let compose_service = match config.compose() {
            Some(_) => Some(config.service()?.to_string()),
            None => None,
        };
        let (spec, dev_container) = match compose_service {
            Some(service) => {
                let compose = config.compose_mut().ok_or_else(|| {
                    OrchestratorError::Internal("compose document missing".to_string())
                })?;
                let spec = self.compose_spec(compose, &service, &workspace_folder, &mut used)?;
                (RuntimeSpec::Compose(spec), service)
            }
            None => {
                let spec = self.container_spec(&config, &workspace_folder, &mut used)?;
                // Left behind by a start that created it but never recorded it.
                tolerate_missing(self.runtime.remove_by_name(&spec.name))?;
                (RuntimeSpec::Container(spec), DEVELOPMENT_CONTAINER.to_string())
            }
        };

        self.check_cancelled()?;
        let handles = self.runtime.create_and_start(&spec)?;
        for handle in &handles {
            notes.push(format!(
                "started container {} (agent port {})",
                handle.name, handle.agent_port
            ));
        }

        let agent_installed = match self.install_agents(&handles, &mut notes) {
            Ok(installed) => installed,
            Err(e) => {
                self.discard_containers(&handles);
                return Err(e);
            }
        };

        Ok(Launched {
            handles,
            dev_container,
            remote_user,
            workspace_folder,
            forward_ports,
            agent_installed,
            notes,
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Config(
                ConfigRetrievalError::Cancelled.into(),
            ));
        }
        Ok(())
    }

    fn labels(&self) -> Vec<(String, String)> {
        vec![(WORKSPACE_LABEL.to_string(), self.workspace_id.to_string())]
    }

    fn container_spec(
        &self,
        config: &DevcontainerConfig,
        workspace_folder: &str,
        used: &mut BTreeSet<u16>,
    ) -> Result<ContainerSpec> {
        let name = container_name(&self.prefix, self.workspace_id);
        let image = match config.image_source()? {
            ImageSource::Image(reference) => ImageSpec::Pull(reference),
            ImageSource::Build {
                dockerfile,
                context,
            } => ImageSpec::Build {
                dockerfile,
                context,
                tag: format!("{name}:latest"),
            },
        };

        Ok(ContainerSpec {
            name,
            logical_name: DEVELOPMENT_CONTAINER.to_string(),
            image,
            workspace_volume: self.volume.clone(),
            workspace_folder: workspace_folder.to_string(),
            env: config.container_env()?,
            agent_host_port: AGENT_PORT_RANGE.allocate(used)?,
            labels: self.labels(),
        })
    }

    fn compose_spec(
        &self,
        compose: &mut ComposeDocument,
        service: &str,
        workspace_folder: &str,
        used: &mut BTreeSet<u16>,
    ) -> Result<ComposeSpec> {
        let source = compose.workspace_volume(service, workspace_folder)?;

        let mut agent_ports = BTreeMap::new();
        for name in compose.service_names()? {
            agent_ports.insert(name, AGENT_PORT_RANGE.allocate(used)?);
        }

        compose.rewrite(&ComposeRewrite {
            workspace_volume_source: source,
            replacement_volume: self.volume.clone(),
            agent_ports: agent_ports.clone(),
            agent_container_port: AGENT_CONTAINER_PORT,
            labels: self.labels(),
        })?;
        compose.save()?;

        Ok(ComposeSpec {
            project: compose_project(&self.prefix, self.workspace_id),
            file: compose.path().to_path_buf(),
            agent_ports,
        })
    }

    /// Copies the agent into every container and launches it. Returns false
    /// when no agent binary is configured.
    fn install_agents(&self, handles: &[ContainerHandle], notes: &mut Vec<String>) -> Result<bool> {
        let Some(binary_path) = &self.agent_binary else {
            return Ok(false);
        };
        let binary = std::fs::read(binary_path)?;
        let target = Path::new(AGENT_INSTALL_DIR).join(AGENT_BINARY_NAME);
        let target_str = target.to_string_lossy().to_string();

        let as_root = ExecOptions {
            user: Some("root".to_string()),
            ..Default::default()
        };

        for handle in handles {
            self.check_cancelled()?;
            self.exec_checked(handle, &["mkdir", "-p", AGENT_INSTALL_DIR], &as_root)?;
            self.runtime.copy_file(handle, &target, &binary)?;
            self.exec_checked(handle, &["chmod", "+x", &target_str], &as_root)?;
            self.runtime.exec(
                handle,
                std::slice::from_ref(&target_str),
                &ExecOptions {
                    working_dir: Some(AGENT_INSTALL_DIR.to_string()),
                    user: Some("root".to_string()),
                    env: Vec::new(),
                    detached: true,
                },
            )?;
            notes.push(format!("agent launched in {}", handle.name));
        }
        Ok(true)
    }

    fn exec_checked(
        &self,
        handle: &ContainerHandle,
        command: &[&str],
        options: &ExecOptions,
    ) -> Result<()> {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let output = self.runtime.exec(handle, &command, options)?;
        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                command: command.join(" "),
                stderr: output.combined(),
            }
            .into());
        }
        Ok(())
    }

    fn discard_containers(&self, handles: &[ContainerHandle]) {
        for handle in handles {
            if let Err(e) = self.runtime.remove(handle) {
                warn!(container = %handle.id, error = %e, "could not remove container");
            }
        }
    }
}
