use crate::lifecycle::{LifecycleManager, OrchestratorSettings};
use crate::models::{CreateWorkspaceRequest, Workspace};
use crate::registry::EndpointRegistry;
use crate::store::WorkspaceStore;
use codebox_config::test_helpers::LocalDirFetcher;
use codebox_config::{ConfigResolver, ResolverSettings};
use codebox_runtime::mock::MockRuntime;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Writes `files` (relative path, content) below `root`.
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create fixture dir");
        }
        std::fs::write(path, content).expect("Failed to write fixture file");
    }
}

/// A lifecycle manager wired to a mock runtime and a local fixture repository.
pub struct TestHarness {
    pub manager: LifecycleManager,
    pub store: WorkspaceStore,
    pub registry: EndpointRegistry,
    pub runtime: Arc<MockRuntime>,
    pub fetcher: Arc<LocalDirFetcher>,
    pub repo: TempDir,
    pub data: TempDir,
}

impl TestHarness {
    /// Repository holding `.devcontainer/devcontainer.json` with `descriptor`.
    pub async fn new(descriptor: &str) -> Self {
        Self::with_files(
            &[(".devcontainer/devcontainer.json", descriptor)],
            OrchestratorSettings::default(),
            |root| LocalDirFetcher::new(root),
        )
        .await
    }

    pub async fn with_files(
        files: &[(&str, &str)],
        settings: OrchestratorSettings,
        fetcher: impl FnOnce(&Path) -> LocalDirFetcher,
    ) -> Self {
        let repo = TempDir::new().expect("Failed to create repo dir");
        let data = TempDir::new().expect("Failed to create data dir");
        write_files(repo.path(), files);

        let store = WorkspaceStore::new(create_test_db().await, 1000);
        let registry = EndpointRegistry::new();
        let runtime = Arc::new(MockRuntime::new());
        let fetcher = Arc::new(fetcher(repo.path()));
        let resolver = Arc::new(ConfigResolver::new(
            ResolverSettings {
                data_dir: data.path().to_path_buf(),
            },
            fetcher.clone(),
        ));

        let manager = LifecycleManager::new(
            store.clone(),
            runtime.clone(),
            resolver,
            registry.clone(),
            settings,
        );

        Self {
            manager,
            store,
            registry,
            runtime,
            fetcher,
            repo,
            data,
        }
    }

    pub async fn create_workspace(&self, name: &str) -> Workspace {
        let user = self
            .store
            .ensure_user("alice")
            .await
            .expect("Failed to create user");

        self.store
            .create_workspace(CreateWorkspaceRequest {
                name: name.to_string(),
                user_id: user.id,
                kind: crate::models::WorkspaceKind::Devcontainer,
                git_repo_url: "https://git.example.com/alice/project.git".to_string(),
                git_repo_config_folder: ".devcontainer".to_string(),
                git_branch: None,
                custom_config: None,
            })
            .await
            .expect("Failed to create workspace")
    }
}
