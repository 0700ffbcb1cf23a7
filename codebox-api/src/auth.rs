use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use codebox_orchestrator::{Workspace, WorkspaceStore};

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub id: i64,
    pub username: String,
}

/// Auth middleware - identity is established by the proxy in front of the
/// server, which sets the `x-user` header. First sight of a username
/// creates the user record.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let username = req
        .headers()
        .get("x-user")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Unauthorized("Missing user".to_string()))?;

    let user = state.store().ensure_user(&username).await?;

    req.extensions_mut().insert(AuthenticatedUser {
        id: user.id,
        username: user.username,
    });

    Ok(next.run(req).await)
}

/// Loads the workspace and checks the authenticated user owns it
///
/// Returns:
/// - ApiError::NotFound if the workspace doesn't exist
/// - ApiError::Forbidden if the workspace exists but the user is not the owner
pub async fn check_workspace_owner(
    store: &WorkspaceStore,
    workspace_id: i64,
    user: &AuthenticatedUser,
) -> Result<Workspace, ApiError> {
    let workspace = store
        .get_workspace(workspace_id)
        .await
        .map_err(|_| ApiError::NotFound(format!("Workspace not found: {workspace_id}")))?;

    if workspace.user_id != user.id {
        return Err(ApiError::Forbidden(format!(
            "Access denied: workspace {workspace_id} belongs to another user"
        )));
    }

    Ok(workspace)
}
