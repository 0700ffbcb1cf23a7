use anyhow::{Context, Result};
use codebox_api::{create_app, start_agent_monitor_task, AppState, Config};
use codebox_config::{ConfigResolver, Git2Fetcher};
use codebox_logging::{init_subscriber, LoggingConfig};
use codebox_orchestrator::db::{create_pool, run_migrations};
use codebox_orchestrator::{EndpointRegistry, LifecycleManager, WorkspaceStore};
use codebox_proxy::{PortForwarding, ReverseProxyFactory};
use codebox_runtime::DockerRuntime;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    let _log_guard = init_subscriber(&LoggingConfig::from_env(config.log_file()));

    info!("Starting codebox-api service...");
    info!(
        "Configuration loaded: bind_addr={}, data_dir={}, wildcard_domain={}",
        config.bind_addr,
        config.data_dir.display(),
        config.wildcard_domain
    );

    // Database setup
    let pool = create_pool(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    info!("Running database migrations...");
    run_migrations(&pool).await.context("running migrations")?;
    info!("Migrations complete");

    let store = WorkspaceStore::new(pool.clone(), config.log_capacity);
    let registry = EndpointRegistry::new();
    let resolver = Arc::new(ConfigResolver::new(
        config.resolver_settings(),
        Arc::new(Git2Fetcher::new(config.clone_timeout())),
    ));
    let manager = LifecycleManager::new(
        store.clone(),
        Arc::new(DockerRuntime::new()),
        resolver,
        registry.clone(),
        config.orchestrator_settings(),
    );

    if let Err(e) = manager.restore_endpoints().await {
        warn!("Failed to restore endpoints of running workspaces: {}", e);
    }

    let forwarding = PortForwarding::new(
        registry,
        ReverseProxyFactory::new(&config.proxy_settings()).context("building proxy client")?,
        config.forwarding_settings(),
    )
    .context("configuring port forwarding")?;

    // Start agent monitor task
    let monitor = tokio::spawn(start_agent_monitor_task(
        store,
        config.agent_monitor_interval(),
    ));

    let app = create_app(AppState::new(manager), forwarding);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    monitor.abort();
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
