//! Middleware that intercepts forwarding hostnames ahead of normal routing.

use crate::error::{ProxyError, RoutingError};
use crate::reverse_proxy::ReverseProxyFactory;
use crate::subdomain::{decode_host, ForwardTarget};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use codebox_orchestrator::EndpointRegistry;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ForwardingSettings {
    /// Domain under which `codebox--…` subdomains are served.
    pub wildcard_domain: String,
    /// Name of the session cookie; part of the subdomain auth callback path.
    pub auth_cookie_name: String,
    /// Headers stamped on every forwarded request, replacing same-named ones.
    pub forward_headers: Vec<(String, String)>,
}

/// Characters kept verbatim in an escaped path segment besides ASCII
/// alphanumerics: the unreserved marks plus `$&+:=@`.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b':')
    .remove(b'=')
    .remove(b'@');

const CALLBACK_PREFIX: &str = "/api/v1/auth/subdomains/callback-";

impl ForwardingSettings {
    /// Path of the subdomain auth callback, with the cookie name escaped as
    /// part of a single path segment.
    pub fn callback_path(&self) -> String {
        format!(
            "{CALLBACK_PREFIX}{}",
            utf8_percent_encode(&self.auth_cookie_name, PATH_SEGMENT)
        )
    }

    /// Whether `path` is the auth callback, escaped or not.
    fn is_callback(&self, path: &str) -> bool {
        if path == self.callback_path() {
            return true;
        }
        match percent_decode_str(path).decode_utf8() {
            Ok(decoded) => decoded
                .strip_prefix(CALLBACK_PREFIX)
                .is_some_and(|name| name == self.auth_cookie_name),
            Err(_) => false,
        }
    }
}

/// Outcome of inspecting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not a forwarding request; route it normally.
    PassThrough,
    Forward {
        target: ForwardTarget,
        address: String,
    },
}

struct Inner {
    registry: EndpointRegistry,
    factory: ReverseProxyFactory,
    settings: ForwardingSettings,
    overrides: HeaderMap,
}

#[derive(Clone)]
pub struct PortForwarding {
    inner: Arc<Inner>,
}

impl PortForwarding {
    pub fn new(
        registry: EndpointRegistry,
        factory: ReverseProxyFactory,
        settings: ForwardingSettings,
    ) -> Result<Self, ProxyError> {
        let mut overrides = HeaderMap::new();
        for (name, value) in &settings.forward_headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| ProxyError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|_| ProxyError::InvalidHeader(name.to_string()))?;
            overrides.append(name, value);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                factory,
                settings,
                overrides,
            }),
        })
    }

    pub fn settings(&self) -> &ForwardingSettings {
        &self.inner.settings
    }

    /// Decides what to do with a request for `host` and `path`. Reads only
    /// the registry; never blocks.
    pub fn resolve(&self, host: &str, path: &str) -> Result<Decision, RoutingError> {
        let Some(raw) = decode_host(host, &self.inner.settings.wildcard_domain)? else {
            return Ok(Decision::PassThrough);
        };

        // The callback authenticates the subdomain session itself.
        if self.inner.settings.is_callback(path) {
            return Ok(Decision::PassThrough);
        }

        let target = raw.parse()?;
        let address = self
            .inner
            .registry
            .lookup(target.workspace_id, &target.container, target.port)
            .ok_or_else(|| RoutingError::UnknownEndpoint {
                workspace_id: target.workspace_id,
                container: target.container.clone(),
                port: target.port,
            })?;

        Ok(Decision::Forward { target, address })
    }

    async fn forward(
        &self,
        target: &ForwardTarget,
        address: &str,
        req: Request,
    ) -> Result<Response, ProxyError> {
        let client_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let url = ReverseProxyFactory::endpoint_url(address, target.port)?;
        self.inner
            .factory
            .build(url, self.inner.overrides.clone())
            .forward(req, client_ip)
            .await
    }
}

fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

/// Port-forwarding middleware, for `axum::middleware::from_fn_with_state`.
///
/// Requests outside the wildcard domain continue to `next`. Forwarding
/// requests are proxied when the registry knows the endpoint and answered
/// with 404 otherwise.
pub async fn port_forwarding(
    State(forwarding): State<PortForwarding>,
    req: Request,
    next: Next,
) -> Response {
    let Some(host) = request_host(&req) else {
        return next.run(req).await;
    };

    match forwarding.resolve(&host, req.uri().path()) {
        Ok(Decision::PassThrough) => next.run(req).await,
        Ok(Decision::Forward { target, address }) => {
            match forwarding.forward(&target, &address, req).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        workspace_id = target.workspace_id,
                        container = %target.container,
                        port = target.port,
                        error = %e,
                        "forwarding failed"
                    );
                    e.into_response()
                }
            }
        }
        Err(e) => {
            debug!(%host, error = %e, "refusing forwarding request");
            e.into_response()
        }
    }
}
