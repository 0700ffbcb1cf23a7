pub mod agent_monitor;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use agent_monitor::{check_agents, start_agent_monitor_task};
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
