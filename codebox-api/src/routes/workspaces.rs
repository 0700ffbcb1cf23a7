use crate::{
    auth::{check_workspace_owner, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use codebox_orchestrator::{
    CreateWorkspaceRequest, LifecycleOp, LogEntry, Workspace, WorkspaceContainer, WorkspaceKind,
};
use serde::Deserialize;
use tracing::info;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/workspaces",
            get(list_workspaces).post(create_workspace),
        )
        .route(
            "/api/v1/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/api/v1/workspaces/{id}/start", post(start_workspace))
        .route("/api/v1/workspaces/{id}/stop", post(stop_workspace))
        .route(
            "/api/v1/workspaces/{id}/refresh-config",
            post(refresh_workspace_config),
        )
        .route("/api/v1/workspaces/{id}/logs", get(workspace_logs))
        .route("/api/v1/workspaces/{id}/containers", get(workspace_containers))
}

/// Workspace creation payload; the owner always comes from the caller.
#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceBody {
    pub name: String,
    #[serde(default)]
    pub kind: Option<WorkspaceKind>,
    pub git_repo_url: String,
    #[serde(default)]
    pub git_repo_config_folder: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub custom_config: Option<serde_json::Value>,
}

async fn create_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<CreateWorkspaceBody>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    let req = CreateWorkspaceRequest {
        name: body.name,
        user_id: user.id,
        kind: body.kind.unwrap_or(WorkspaceKind::Devcontainer),
        git_repo_url: body.git_repo_url,
        git_repo_config_folder: body
            .git_repo_config_folder
            .unwrap_or_else(|| ".devcontainer".to_string()),
        git_branch: body.git_branch,
        custom_config: body.custom_config,
    };

    let workspace = state.store().create_workspace(req).await?;
    info!(workspace_id = workspace.id, user = %user.username, "workspace created");

    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn list_workspaces(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<Vec<Workspace>>> {
    let workspaces = state.store().list_workspaces(Some(user.id)).await?;
    Ok(Json(workspaces))
}

async fn get_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Workspace>> {
    let workspace = check_workspace_owner(state.store(), id, &user).await?;
    Ok(Json(workspace))
}

/// Queues `op` and answers right away; the work runs on the worker pool.
async fn accept(
    state: &AppState,
    user: &AuthenticatedUser,
    id: i64,
    op: LifecycleOp,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    let workspace = check_workspace_owner(state.store(), id, user).await?;
    // The outcome lands in the workspace status and log.
    drop(state.manager.dispatch(id, op));
    info!(workspace_id = id, %op, user = %user.username, "operation queued");

    Ok((StatusCode::ACCEPTED, Json(workspace)))
}

async fn start_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    accept(&state, &user, id, LifecycleOp::Start).await
}

async fn stop_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    accept(&state, &user, id, LifecycleOp::Stop).await
}

async fn refresh_workspace_config(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    accept(&state, &user, id, LifecycleOp::RefreshConfig).await
}

async fn delete_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    accept(&state, &user, id, LifecycleOp::Delete).await
}

async fn workspace_logs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    check_workspace_owner(state.store(), id, &user).await?;
    Ok(Json(state.store().logs(id).await?))
}

async fn workspace_containers(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<WorkspaceContainer>>> {
    check_workspace_owner(state.store(), id, &user).await?;
    Ok(Json(state.store().list_containers(id).await?))
}
