use chrono::Utc;
use codebox_orchestrator::{AgentStatus, WorkspaceContainer, WorkspaceStore};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, error, info, warn};

/// Agent ports are published on the engine host.
const AGENT_HOST: &str = "127.0.0.1";
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn start_agent_monitor_task(store: WorkspaceStore, every: Duration) {
    let mut interval = interval(every);

    info!(
        "Agent monitor running (checks every {} seconds)",
        every.as_secs()
    );

    loop {
        interval.tick().await;

        if let Err(e) = check_agents(&store).await {
            error!("Agent check failed: {}", e);
        }
    }
}

/// Dials the agent of every running container once and records the
/// outcome. Returns how many agents answered.
pub async fn check_agents(store: &WorkspaceStore) -> anyhow::Result<usize> {
    let containers = store.running_containers().await?;
    let mut reachable = 0;

    for container in containers {
        if dial(&container).await {
            reachable += 1;
            store
                .set_agent_status(container.id, AgentStatus::Running, Some(Utc::now()))
                .await?;
        } else {
            if container.agent_status != AgentStatus::Error {
                warn!(
                    workspace_id = container.workspace_id,
                    container = %container.name,
                    port = container.agent_external_port,
                    "agent unreachable"
                );
            }
            store
                .set_agent_status(container.id, AgentStatus::Error, None)
                .await?;
        }
    }

    Ok(reachable)
}

async fn dial(container: &WorkspaceContainer) -> bool {
    let target = (AGENT_HOST, container.agent_external_port);
    match timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(container = %container.name, error = %e, "agent connection refused");
            false
        }
        Err(_) => false,
    }
}
