//! Common test utilities and helpers for codebox-api tests

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::Request,
    response::Response,
    Router,
};
use codebox_api::{create_app, AppState};
use codebox_orchestrator::test_utils::TestHarness;
use codebox_orchestrator::{WorkspaceStatus, WorkspaceStore};
use codebox_proxy::{ForwardingSettings, PortForwarding, ProxySettings, ReverseProxyFactory};
use serde_json::Value;
use std::time::Duration;

pub const DOMAIN: &str = "ws.test";

pub const DESCRIPTOR: &str = r#"{
    "image": "mcr.microsoft.com/devcontainers/base:ubuntu",
    "forwardPorts": [3000]
}"#;

pub struct TestApp {
    pub app: Router,
    pub harness: TestHarness,
}

impl TestApp {
    pub fn store(&self) -> &WorkspaceStore {
        &self.harness.store
    }
}

/// The full router over a lifecycle manager with a mock runtime.
pub async fn create_test_app() -> TestApp {
    let harness = TestHarness::new(DESCRIPTOR).await;

    let forwarding = PortForwarding::new(
        harness.registry.clone(),
        ReverseProxyFactory::new(&ProxySettings::default()).expect("Failed to build proxy"),
        ForwardingSettings {
            wildcard_domain: DOMAIN.to_string(),
            auth_cookie_name: "codebox_auth_token".to_string(),
            forward_headers: Vec::new(),
        },
    )
    .expect("Failed to configure forwarding");

    let app = create_app(AppState::new(harness.manager.clone()), forwarding);
    TestApp { app, harness }
}

pub fn json_request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user", user);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn extract_json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).expect("Response body is not JSON")
}

/// Polls the store until the workspace reaches `status`.
pub async fn wait_for_status(store: &WorkspaceStore, id: i64, status: WorkspaceStatus) {
    for _ in 0..200 {
        match store.get_workspace(id).await {
            Ok(workspace) if workspace.status == status => return,
            _ => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    }
    panic!("workspace {id} never reached {status}");
}

/// Polls until the workspace record is gone.
pub async fn wait_for_deletion(store: &WorkspaceStore, id: i64) {
    for _ in 0..200 {
        if store.get_workspace(id).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("workspace {id} was never deleted");
}
