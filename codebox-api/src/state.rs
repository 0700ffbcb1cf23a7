use codebox_orchestrator::{LifecycleManager, WorkspaceStore};

#[derive(Clone)]
pub struct AppState {
    pub manager: LifecycleManager,
}

impl AppState {
    pub fn new(manager: LifecycleManager) -> Self {
        Self { manager }
    }

    pub fn store(&self) -> &WorkspaceStore {
        self.manager.store()
    }
}
