//! Workspace lifecycle: creating → starting → running → stopping → stopped,
//! with `error` reachable from every operation.
//!
//! Operations on one workspace run strictly one after another, in the order
//! they were dispatched; a worker task per busy workspace drains its queue.
//! Across workspaces, a semaphore bounds how many operations run at once.

use crate::driver::OperationContext;
use crate::error::{OrchestratorError, Result};
use crate::models::{ContainerStatus, WorkspaceStatus};
use crate::registry::{Endpoint, EndpointRegistry};
use crate::store::WorkspaceStore;
use chrono::Utc;
use codebox_config::{CancelFlag, ConfigResolver};
use codebox_runtime::ContainerRuntime;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Prefix of every engine object (containers, volumes, projects) we create.
    pub objects_prefix: String,
    /// Lifecycle operations allowed to run at the same time.
    pub worker_pool_size: usize,
    /// Agent installed into every started container, if set.
    pub agent_binary: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            objects_prefix: "codebox".to_string(),
            worker_pool_size: 1,
            agent_binary: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Start,
    Stop,
    Delete,
    RefreshConfig,
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Delete => "delete",
            LifecycleOp::RefreshConfig => "refresh config",
        })
    }
}

struct Job {
    op: LifecycleOp,
    reply: oneshot::Sender<Result<()>>,
}

struct Inner {
    store: WorkspaceStore,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<ConfigResolver>,
    registry: EndpointRegistry,
    settings: Arc<OrchestratorSettings>,
    pool: Semaphore,
    queues: Mutex<HashMap<i64, mpsc::UnboundedSender<Job>>>,
    inflight: Mutex<HashMap<i64, CancelFlag>>,
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(
        store: WorkspaceStore,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<ConfigResolver>,
        registry: EndpointRegistry,
        settings: OrchestratorSettings,
    ) -> Self {
        let permits = settings.worker_pool_size.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                runtime,
                resolver,
                registry,
                settings: Arc::new(settings),
                pool: Semaphore::new(permits),
                queues: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &WorkspaceStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Queues `op` behind any operation already pending for the workspace.
    ///
    /// The receiver yields the outcome; dropping it does not cancel the
    /// operation. A delete raises the cancel flag of the operation currently
    /// running so a long start gives up early.
    pub fn dispatch(&self, workspace_id: i64, op: LifecycleOp) -> oneshot::Receiver<Result<()>> {
        if op == LifecycleOp::Delete {
            let inflight = self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(flag) = inflight.get(&workspace_id) {
                info!(workspace_id, "cancelling in-flight operation for delete");
                flag.cancel();
            }
        }

        let (reply, outcome) = oneshot::channel();
        let job = Job { op, reply };

        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        let job = match queues.get(&workspace_id) {
            Some(queue) => match queue.send(job) {
                Ok(()) => return outcome,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (queue, jobs) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = queue.send(job);
        queues.insert(workspace_id, queue);
        drop(queues);

        tokio::spawn(self.clone().drain(workspace_id, jobs));
        outcome
    }

    /// Dispatches `op` and waits for it to finish.
    pub async fn run(&self, workspace_id: i64, op: LifecycleOp) -> Result<()> {
        self.dispatch(workspace_id, op)
            .await
            .map_err(|_| OrchestratorError::Internal("lifecycle worker went away".to_string()))?
    }

    /// Publishes endpoints for every workspace persisted as running.
    pub async fn restore_endpoints(&self) -> Result<()> {
        for workspace in self.inner.store.list_workspaces(None).await? {
            if workspace.status == WorkspaceStatus::Running {
                self.publish(workspace.id).await?;
            }
        }
        Ok(())
    }

    async fn drain(self, workspace_id: i64, mut jobs: mpsc::UnboundedReceiver<Job>) {
        loop {
            let job = match jobs.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
                    match jobs.try_recv() {
                        Ok(job) => job,
                        Err(_) => {
                            queues.remove(&workspace_id);
                            debug!(workspace_id, "lifecycle queue drained");
                            return;
                        }
                    }
                }
            };

            let outcome = self.execute(workspace_id, job.op).await;
            let _ = job.reply.send(outcome);
        }
    }

    #[instrument(skip(self, op), fields(op = %op))]
    async fn execute(&self, workspace_id: i64, op: LifecycleOp) -> Result<()> {
        let cancel = CancelFlag::new();
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workspace_id, cancel.clone());

        let outcome = self.execute_registered(workspace_id, op, cancel).await;

        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&workspace_id);
        outcome
    }

    async fn execute_registered(
        &self,
        workspace_id: i64,
        op: LifecycleOp,
        cancel: CancelFlag,
    ) -> Result<()> {
        let _permit = self
            .inner
            .pool
            .acquire()
            .await
            .map_err(|_| OrchestratorError::Internal("worker pool closed".to_string()))?;

        let workspace = self.inner.store.get_workspace(workspace_id).await?;
        let ctx = OperationContext {
            workspace,
            store: self.inner.store.clone(),
            runtime: self.inner.runtime.clone(),
            resolver: self.inner.resolver.clone(),
            settings: self.inner.settings.clone(),
            cancel,
        };

        let outcome = match op {
            LifecycleOp::Start => self.start(&ctx).await,
            LifecycleOp::Stop => self.stop(&ctx).await,
            LifecycleOp::Delete => self.delete(&ctx).await,
            LifecycleOp::RefreshConfig => self.refresh_config(&ctx).await,
        };

        if let Err(e) = &outcome {
            self.record_failure(workspace_id, op, e).await;
        }
        outcome
    }

    async fn start(&self, ctx: &OperationContext) -> Result<()> {
        let id = ctx.workspace.id;
        if ctx.workspace.status == WorkspaceStatus::Running {
            debug!(workspace_id = id, "already running");
            return Ok(());
        }

        let store = &self.inner.store;
        store.set_status(id, WorkspaceStatus::Starting).await?;
        ctx.workspace.kind.driver().start(ctx).await?;
        self.publish(id).await?;
        store.mark_started(id, Utc::now()).await?;
        store.append_log(id, "workspace started").await?;
        Ok(())
    }

    async fn stop(&self, ctx: &OperationContext) -> Result<()> {
        let id = ctx.workspace.id;
        let store = &self.inner.store;

        self.inner.registry.remove_workspace(id);
        store.set_status(id, WorkspaceStatus::Stopping).await?;
        ctx.workspace.kind.driver().stop(ctx).await?;
        store.set_status(id, WorkspaceStatus::Stopped).await?;
        store.append_log(id, "workspace stopped").await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OperationContext) -> Result<()> {
        let id = ctx.workspace.id;

        self.inner.registry.remove_workspace(id);
        if ctx.workspace.status == WorkspaceStatus::Running {
            self.stop(ctx).await?;
        }
        ctx.workspace.kind.driver().delete(ctx).await?;
        self.inner.store.delete_workspace(id).await?;
        info!(workspace_id = id, "workspace deleted");
        Ok(())
    }

    async fn refresh_config(&self, ctx: &OperationContext) -> Result<()> {
        let id = ctx.workspace.id;
        ctx.workspace.kind.driver().refresh_config(ctx).await?;
        self.inner
            .store
            .append_log(id, "configuration will be fetched again on next start")
            .await?;
        Ok(())
    }

    async fn publish(&self, workspace_id: i64) -> Result<()> {
        let containers = self.inner.store.list_containers(workspace_id).await?;
        let endpoints = containers
            .into_iter()
            .filter(|c| c.container_status == ContainerStatus::Running)
            .map(|c| {
                let ports = c
                    .forwarded_ports
                    .iter()
                    .filter(|p| p.active && p.public)
                    .map(|p| p.port_number)
                    .collect();
                (
                    c.name,
                    Endpoint {
                        address: c.external_ipv4,
                        ports,
                    },
                )
            });
        self.inner.registry.publish(workspace_id, endpoints);
        Ok(())
    }

    /// Leaves the workspace in `error` with exactly one log entry describing
    /// what went wrong.
    async fn record_failure(&self, workspace_id: i64, op: LifecycleOp, err: &OrchestratorError) {
        error!(workspace_id, op = %op, error = %err, "lifecycle operation failed");
        self.inner.registry.remove_workspace(workspace_id);

        let store = &self.inner.store;
        if op == LifecycleOp::Start {
            if let Err(e) = store
                .set_containers_status(workspace_id, ContainerStatus::Error)
                .await
            {
                warn!(workspace_id, error = %e, "could not mark containers failed");
            }
        }
        if let Err(e) = store.set_status(workspace_id, WorkspaceStatus::Error).await {
            warn!(workspace_id, error = %e, "could not record error status");
            return;
        }
        if let Err(e) = store
            .append_log(workspace_id, &format!("{op} failed: {err}"))
            .await
        {
            warn!(workspace_id, error = %e, "could not append failure to workspace log");
        }
    }
}
