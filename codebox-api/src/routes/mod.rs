pub mod health;
pub mod workspaces;

use crate::{auth::auth_middleware, error::ApiError, state::AppState};
use axum::{middleware, Router};
use codebox_proxy::{port_forwarding, PortForwarding};
use tower_http::trace::TraceLayer;

pub fn create_app(state: AppState, forwarding: PortForwarding) -> Router {
    Router::new()
        .merge(health::routes()) // Health routes don't need auth
        .merge(
            workspaces::routes()
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        // Outermost: forwarding hostnames never reach the API routes.
        .layer(middleware::from_fn_with_state(forwarding, port_forwarding))
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}
