//! Integration tests for codebox-orchestrator
//!
//! Drives the lifecycle manager against a mock container runtime and a local
//! fixture repository: start/stop/delete transitions, single-flight
//! behaviour, failure capture, and the persisted records behind them.

use chrono::Utc;
use codebox_config::test_helpers::LocalDirFetcher;
use codebox_runtime::mock::MockCall;
use codebox_runtime::RuntimeSpec;
use codebox_orchestrator::test_utils::{create_test_db, TestHarness};
use codebox_orchestrator::{
    AgentStatus, ConnectionType, ContainerStatus, CreateWorkspaceRequest, LifecycleOp,
    OrchestratorError, OrchestratorSettings, WorkspaceKind, WorkspaceStatus, WorkspaceStore,
};
use std::time::Duration;

const SIMPLE: &str = r#"{
    // single container
    "image": "mcr.microsoft.com/devcontainers/base:ubuntu",
    "forwardPorts": [3000],
    "remoteUser": "vscode",
}"#;

const COMPOSE_DESCRIPTOR: &str = r#"{
    "dockerComposeFile": "docker-compose.yml",
    "service": "app",
    "workspaceFolder": "/workspace",
    "forwardPorts": [3000, "db:5432"]
}"#;

const COMPOSE_FILE: &str = r#"
services:
  app:
    image: node:20
    volumes:
      - src:/workspace
  db:
    image: postgres:16
volumes:
  src:
"#;

fn compose_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (".devcontainer/devcontainer.json", COMPOSE_DESCRIPTOR),
        (".devcontainer/docker-compose.yml", COMPOSE_FILE),
    ]
}

fn port_numbers(container: &codebox_orchestrator::WorkspaceContainer) -> Vec<(u16, bool)> {
    container
        .forwarded_ports
        .iter()
        .map(|p| (p.port_number, p.active))
        .collect()
}

#[tokio::test]
async fn test_create_workspace() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;

    assert_eq!(workspace.name, "demo");
    assert_eq!(workspace.kind, WorkspaceKind::Devcontainer);
    assert_eq!(workspace.git_repo_config_folder, ".devcontainer");
    assert!(workspace.config_archive.is_none());
    assert!(workspace.last_start_on.is_none());

    match workspace.status {
        WorkspaceStatus::Creating => {}
        _ => panic!("Expected Creating status, got {:?}", workspace.status),
    }
}

#[tokio::test]
async fn test_create_workspace_validation() {
    let h = TestHarness::new(SIMPLE).await;
    let user = h.store.ensure_user("alice").await.unwrap();

    let result = h
        .store
        .create_workspace(CreateWorkspaceRequest {
            name: "  ".to_string(),
            user_id: user.id,
            kind: WorkspaceKind::Devcontainer,
            git_repo_url: "https://git.example.com/a.git".to_string(),
            git_repo_config_folder: ".devcontainer".to_string(),
            git_branch: None,
            custom_config: None,
        })
        .await;
    assert!(matches!(result, Err(OrchestratorError::InvalidInput(_))));

    let result = h
        .store
        .create_workspace(CreateWorkspaceRequest {
            name: "demo".to_string(),
            user_id: user.id + 100,
            kind: WorkspaceKind::Devcontainer,
            git_repo_url: "https://git.example.com/a.git".to_string(),
            git_repo_config_folder: ".devcontainer".to_string(),
            git_branch: None,
            custom_config: None,
        })
        .await;
    assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn test_start_reaches_running() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;
    let began = Utc::now();

    h.manager
        .run(workspace.id, LifecycleOp::Start)
        .await
        .expect("start failed");

    let workspace = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Running);
    let archive = workspace.config_archive.expect("archive recorded");
    assert!(!archive.is_empty());
    assert!(std::path::Path::new(&archive).is_file());
    let started = workspace.last_start_on.expect("last start recorded");
    assert!(started.timestamp_millis() >= began.timestamp_millis());

    let containers = h.store.list_containers(workspace.id).await.unwrap();
    assert_eq!(containers.len(), 1);
    let dev = &containers[0];
    assert_eq!(dev.name, "development");
    assert_eq!(dev.container_user, "vscode");
    assert_eq!(dev.container_status, ContainerStatus::Running);
    assert_eq!(dev.agent_status, AgentStatus::Starting);
    assert_eq!(dev.workspace_path_in_container, "/workspace");
    assert!(dev.can_connect_remote_developing);
    assert!((50000..60000).contains(&dev.agent_external_port));

    let ports: Vec<(u16, ConnectionType)> = dev
        .forwarded_ports
        .iter()
        .map(|p| (p.port_number, p.connection_type))
        .collect();
    assert_eq!(
        ports,
        vec![(2222, ConnectionType::Ws), (3000, ConnectionType::Http)]
    );

    assert_eq!(
        h.registry.lookup(workspace.id, "development", 3000).as_deref(),
        Some("127.0.0.1")
    );
    assert_eq!(h.registry.lookup(workspace.id, "development", 8080), None);

    let spec = h
        .runtime
        .calls()
        .into_iter()
        .find_map(|c| match c {
            MockCall::CreateAndStart(RuntimeSpec::Container(spec)) => Some(spec),
            _ => None,
        })
        .expect("container created");
    assert_eq!(spec.name, format!("codebox-workspace-{}", workspace.id));
    assert_eq!(
        spec.workspace_volume,
        format!("codebox-workspace-demo-{}-data", workspace.id)
    );
    assert_eq!(spec.workspace_folder, "/workspace");

    let logs = h.store.logs(workspace.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message == "workspace started"));
}

#[tokio::test]
async fn test_double_start_clones_once() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;

    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();
    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    assert_eq!(h.fetcher.clone_count(), 1);
    assert_eq!(
        h.runtime
            .count(|c| matches!(c, MockCall::CreateAndStart(_))),
        1
    );
}

#[tokio::test]
async fn test_concurrent_starts_are_serialized() {
    let h = TestHarness::with_files(
        &[(".devcontainer/devcontainer.json", SIMPLE)],
        OrchestratorSettings::default(),
        |root| LocalDirFetcher::new(root).with_delay(Duration::from_millis(200)),
    )
    .await;
    let workspace = h.create_workspace("demo").await;

    let (first, second) = tokio::join!(
        h.manager.run(workspace.id, LifecycleOp::Start),
        h.manager.run(workspace.id, LifecycleOp::Start),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(h.fetcher.clone_count(), 1);
    assert_eq!(
        h.runtime
            .count(|c| matches!(c, MockCall::CreateAndStart(_))),
        1
    );
    let workspace = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Running);
}

#[tokio::test]
async fn test_clone_failure_marks_error() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;
    h.fetcher.fail_with("repository not found");

    let err = h
        .manager
        .run(workspace.id, LifecycleOp::Start)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("repository not found"));

    let workspace = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Error);
    assert!(workspace.config_archive.is_none());

    let logs = h.store.logs(workspace.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].message.starts_with("start failed"));
    assert!(logs[0].message.contains("repository not found"));

    assert!(!h.registry.contains_workspace(workspace.id));
    assert_eq!(
        h.runtime
            .count(|c| matches!(c, MockCall::CreateAndStart(_))),
        0
    );
}

#[tokio::test]
async fn test_runtime_failure_marks_error() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;
    h.runtime.fail_on("create_and_start", "no space left on device");

    assert!(h
        .manager
        .run(workspace.id, LifecycleOp::Start)
        .await
        .is_err());

    let workspace = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Error);
    let logs = h.store.logs(workspace.id).await.unwrap();
    let last = logs.last().expect("failure logged");
    assert!(last.message.starts_with("start failed"));
    assert!(last.message.contains("no space left on device"));

    // Recovers once the engine does
    h.runtime.clear_failures();
    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();
    let workspace = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Running);
}

#[tokio::test]
async fn test_failed_start_keeps_cached_config() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;
    h.runtime.fail_on("create_and_start", "port is already allocated");

    assert!(h
        .manager
        .run(workspace.id, LifecycleOp::Start)
        .await
        .is_err());

    let failed = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(failed.status, WorkspaceStatus::Error);
    let archive = failed.config_archive.expect("archive recorded despite the failure");
    assert!(std::path::Path::new(&archive).is_file());

    h.runtime.clear_failures();
    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    assert_eq!(h.fetcher.clone_count(), 1);
    let started = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(started.status, WorkspaceStatus::Running);
    assert_eq!(started.config_archive.as_deref(), Some(archive.as_str()));
}

#[tokio::test]
async fn test_retry_clears_container_left_by_failed_start() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;
    let name = format!("codebox-workspace-{}", workspace.id);

    // The engine created the container but could not start it; nothing
    // about it was recorded.
    h.runtime.fail_on("create_and_start", "port is already allocated");
    assert!(h
        .manager
        .run(workspace.id, LifecycleOp::Start)
        .await
        .is_err());
    assert!(h.store.list_containers(workspace.id).await.unwrap().is_empty());

    h.runtime.clear_failures();
    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    let calls = h.runtime.calls();
    let cleared = calls
        .iter()
        .rposition(|c| *c == MockCall::RemoveByName(name.clone()))
        .expect("leftover container removed by name");
    let created = calls
        .iter()
        .rposition(|c| matches!(c, MockCall::CreateAndStart(_)))
        .unwrap();
    assert!(cleared < created);

    let workspace = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Running);
    assert_eq!(h.store.list_containers(workspace.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_clone_progress_is_logged() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;

    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    let messages: Vec<String> = h
        .store
        .logs(workspace.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.message)
        .collect();
    let progress = messages
        .iter()
        .position(|m| m == "received 1/1 objects")
        .expect("clone progress logged");
    let fetched = messages
        .iter()
        .position(|m| m == "fetched configuration from https://git.example.com/alice/project.git")
        .expect("fetch logged");
    assert!(progress < fetched);

    // A cached archive means no clone and no progress
    h.manager.run(workspace.id, LifecycleOp::Stop).await.unwrap();
    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();
    let received = h
        .store
        .logs(workspace.id)
        .await
        .unwrap()
        .iter()
        .filter(|l| l.message.starts_with("received"))
        .count();
    assert_eq!(received, 1);
}

#[tokio::test]
async fn test_stop_then_start_reuses_config_and_ports() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;

    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();
    let before = h.store.list_containers(workspace.id).await.unwrap();

    h.manager.run(workspace.id, LifecycleOp::Stop).await.unwrap();

    let stopped = h.store.get_workspace(workspace.id).await.unwrap();
    assert_eq!(stopped.status, WorkspaceStatus::Stopped);
    assert!(!h.registry.contains_workspace(workspace.id));
    assert_eq!(h.registry.lookup(workspace.id, "development", 3000), None);

    let containers = h.store.list_containers(workspace.id).await.unwrap();
    assert_eq!(containers[0].container_status, ContainerStatus::Stopped);
    assert_eq!(port_numbers(&containers[0]), vec![(2222, false), (3000, false)]);
    assert_eq!(h.runtime.count(|c| matches!(c, MockCall::Stop(_))), 1);

    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    assert_eq!(h.fetcher.clone_count(), 1);
    // The stopped container is replaced
    assert_eq!(h.runtime.count(|c| matches!(c, MockCall::Remove(_))), 1);

    let after = h.store.list_containers(workspace.id).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(port_numbers(&after[0]), vec![(2222, true), (3000, true)]);
    let ids = |c: &codebox_orchestrator::WorkspaceContainer| {
        c.forwarded_ports.iter().map(|p| p.id).collect::<Vec<_>>()
    };
    assert_eq!(ids(&after[0]), ids(&before[0]));
    assert!(h.registry.lookup(workspace.id, "development", 3000).is_some());
}

#[tokio::test]
async fn test_refresh_config_forces_refetch() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;

    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();
    h.manager
        .run(workspace.id, LifecycleOp::RefreshConfig)
        .await
        .unwrap();

    let refreshed = h.store.get_workspace(workspace.id).await.unwrap();
    assert!(refreshed.config_archive.is_none());
    assert_eq!(refreshed.status, WorkspaceStatus::Running);

    h.manager.run(workspace.id, LifecycleOp::Stop).await.unwrap();
    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();
    assert_eq!(h.fetcher.clone_count(), 2);
}

#[tokio::test]
async fn test_delete_removes_workspace() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;

    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();
    let archive = h
        .store
        .get_workspace(workspace.id)
        .await
        .unwrap()
        .config_archive
        .unwrap();

    h.manager.run(workspace.id, LifecycleOp::Delete).await.unwrap();

    assert!(matches!(
        h.store.get_workspace(workspace.id).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(h.store.list_containers(workspace.id).await.unwrap().is_empty());
    assert!(h.store.logs(workspace.id).await.unwrap().is_empty());
    assert!(!std::path::Path::new(&archive).exists());
    assert!(!h.registry.contains_workspace(workspace.id));

    // Running workspaces are stopped before removal
    let calls = h.runtime.calls();
    let stop = calls.iter().position(|c| matches!(c, MockCall::Stop(_)));
    let remove = calls.iter().position(|c| matches!(c, MockCall::Remove(_)));
    assert!(stop.is_some() && remove.is_some());
    assert!(stop < remove);
}

#[tokio::test]
async fn test_delete_cancels_in_flight_start() {
    let h = TestHarness::with_files(
        &[(".devcontainer/devcontainer.json", SIMPLE)],
        OrchestratorSettings::default(),
        |root| LocalDirFetcher::new(root).with_delay(Duration::from_millis(500)),
    )
    .await;
    let workspace = h.create_workspace("demo").await;

    let start = h.manager.dispatch(workspace.id, LifecycleOp::Start);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.manager.run(workspace.id, LifecycleOp::Delete).await.unwrap();

    let outcome = start.await.unwrap();
    assert!(outcome.is_err());
    assert_eq!(
        h.runtime
            .count(|c| matches!(c, MockCall::CreateAndStart(_))),
        0
    );
    assert!(h.store.get_workspace(workspace.id).await.is_err());
}

#[tokio::test]
async fn test_compose_workspace() {
    let h = TestHarness::with_files(
        &compose_files(),
        OrchestratorSettings::default(),
        |root| LocalDirFetcher::new(root),
    )
    .await;
    let workspace = h.create_workspace("stack").await;

    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    let project = format!("codebox_workspace_{}", workspace.id);
    let spec = h
        .runtime
        .calls()
        .into_iter()
        .find_map(|c| match c {
            MockCall::CreateAndStart(RuntimeSpec::Compose(spec)) => Some(spec),
            _ => None,
        })
        .expect("compose stack created");
    assert_eq!(spec.project, project);
    assert_eq!(spec.agent_ports.len(), 2);
    assert_ne!(spec.agent_ports["app"], spec.agent_ports["db"]);

    let containers = h.store.list_containers(workspace.id).await.unwrap();
    let app = containers.iter().find(|c| c.name == "app").unwrap();
    let db = containers.iter().find(|c| c.name == "db").unwrap();
    assert!(app.can_connect_remote_developing);
    assert!(!db.can_connect_remote_developing);
    assert_eq!(port_numbers(app), vec![(2222, true), (3000, true)]);
    assert_eq!(port_numbers(db), vec![(2222, true), (5432, true)]);

    assert!(h.registry.lookup(workspace.id, "db", 5432).is_some());
    assert!(h.registry.lookup(workspace.id, "app", 5432).is_none());

    h.manager.run(workspace.id, LifecycleOp::Delete).await.unwrap();
    assert_eq!(
        h.runtime.count(|c| *c == MockCall::RemoveProject(project.clone())),
        1
    );
    assert_eq!(
        h.runtime.count(|c| *c == MockCall::RemoveVolume(format!("{project}_data"))),
        1
    );

    // Project networks go with the project, before its volumes
    let calls = h.runtime.calls();
    let down = calls
        .iter()
        .position(|c| *c == MockCall::RemoveProject(project.clone()));
    let volume = calls
        .iter()
        .position(|c| matches!(c, MockCall::RemoveVolume(_)));
    assert!(down < volume);

    // Compose stacks never go through name based removal
    assert_eq!(
        h.runtime.count(|c| matches!(c, MockCall::RemoveByName(_))),
        0
    );
}

#[tokio::test]
async fn test_agent_is_installed() {
    let agent_dir = tempfile::TempDir::new().unwrap();
    let agent = agent_dir.path().join("agent.bin");
    std::fs::write(&agent, b"\x7fELF-agent").unwrap();

    let h = TestHarness::with_files(
        &[(".devcontainer/devcontainer.json", SIMPLE)],
        OrchestratorSettings {
            agent_binary: Some(agent),
            ..OrchestratorSettings::default()
        },
        |root| LocalDirFetcher::new(root),
    )
    .await;
    let workspace = h.create_workspace("demo").await;

    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    let calls = h.runtime.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        MockCall::Exec { command, detached: false, .. } if command.join(" ") == "mkdir -p /opt/codebox"
    )));
    assert!(calls.iter().any(|c| matches!(
        c,
        MockCall::CopyFile { dest, len: 10, .. } if dest.to_string_lossy() == "/opt/codebox/agent.bin"
    )));
    assert!(calls.iter().any(|c| matches!(
        c,
        MockCall::Exec { command, detached: true, .. } if command[0] == "/opt/codebox/agent.bin"
    )));

    let containers = h.store.list_containers(workspace.id).await.unwrap();
    assert_eq!(containers[0].agent_status, AgentStatus::Running);
}

#[tokio::test]
async fn test_restore_endpoints() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;
    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    h.registry.remove_workspace(workspace.id);
    assert_eq!(h.registry.lookup(workspace.id, "development", 3000), None);

    h.manager.restore_endpoints().await.unwrap();
    assert!(h.registry.lookup(workspace.id, "development", 3000).is_some());
}

#[tokio::test]
async fn test_log_is_bounded() {
    let store = WorkspaceStore::new(create_test_db().await, 3);
    let user = store.create_user("bob", None).await.unwrap();
    let workspace = store
        .create_workspace(CreateWorkspaceRequest {
            name: "logs".to_string(),
            user_id: user.id,
            kind: WorkspaceKind::Devcontainer,
            git_repo_url: "https://git.example.com/b.git".to_string(),
            git_repo_config_folder: ".devcontainer".to_string(),
            git_branch: None,
            custom_config: None,
        })
        .await
        .unwrap();

    for i in 0..5 {
        store.append_log(workspace.id, &format!("line {i}")).await.unwrap();
    }

    let messages: Vec<String> = store
        .logs(workspace.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.message)
        .collect();
    assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
}

#[tokio::test]
async fn test_invalid_field_names_the_column() {
    let h = TestHarness::new(SIMPLE).await;
    let workspace = h.create_workspace("demo").await;
    h.manager.run(workspace.id, LifecycleOp::Start).await.unwrap();

    let expect_field = |result: Result<_, OrchestratorError>, expected: &str| match result {
        Err(OrchestratorError::InvalidField { field, .. }) => assert_eq!(field, expected),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected {expected} to be rejected"),
    };

    // A container status is not a valid agent status
    sqlx::query("UPDATE workspace_containers SET agent_status = 'stopped'")
        .execute(h.store.pool())
        .await
        .unwrap();
    expect_field(
        h.store.list_containers(workspace.id).await.map(|_| ()),
        "agent_status",
    );

    sqlx::query("UPDATE workspace_containers SET agent_status = 'running', container_status = 'paused'")
        .execute(h.store.pool())
        .await
        .unwrap();
    expect_field(
        h.store.list_containers(workspace.id).await.map(|_| ()),
        "container_status",
    );

    sqlx::query("UPDATE workspace_containers SET container_status = 'running'")
        .execute(h.store.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE forwarded_ports SET connection_type = 'udp'")
        .execute(h.store.pool())
        .await
        .unwrap();
    expect_field(
        h.store.list_containers(workspace.id).await.map(|_| ()),
        "connection_type",
    );

    sqlx::query("UPDATE workspaces SET status = 'hibernating'")
        .execute(h.store.pool())
        .await
        .unwrap();
    expect_field(h.store.get_workspace(workspace.id).await.map(|_| ()), "status");
}
