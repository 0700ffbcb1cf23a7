use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a forwarding request was refused. Rendered as a bare 404 so
/// callers learn nothing about which workspaces or containers exist.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("subdomain does not start with the forwarding prefix")]
    MissingPrefix,

    #[error("expected 4 subdomain parts, found {0}")]
    PartCount(usize),

    #[error("invalid workspace id '{0}'")]
    InvalidWorkspaceId(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("no running endpoint for workspace {workspace_id} container '{container}' port {port}")]
    UnknownEndpoint {
        workspace_id: i64,
        container: String,
        port: u16,
    },
}

impl IntoResponse for RoutingError {
    fn into_response(self) -> Response {
        (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Invalid upstream target: {0}")]
    InvalidTarget(String),

    #[error("Invalid forwarding header '{0}'")]
    InvalidHeader(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_GATEWAY, Json(json!({ "error": "Bad gateway" }))).into_response()
    }
}
