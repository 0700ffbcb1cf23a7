//! HTTP forwarding to container endpoints.
//!
//! Plain requests are streamed through a shared [`reqwest::Client`]. Requests
//! asking for a protocol upgrade (WebSocket, the agent's SSH tunnel) are
//! forwarded with their `Upgrade` header; once the container answers
//! `101 Switching Protocols` both connections are spliced together.

use crate::error::ProxyError;
use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::Response;
use hyper_util::rt::TokioIo;
use reqwest::Client;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// TLS handshake budget, on top of the configured dial timeout.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Transport settings for forwarded requests.
///
/// * `timeout` - dial timeout for upstream connections
/// * `keep_alive` - TCP keep-alive interval on upstream connections
/// * `skip_tls_verify` - accept self-signed certificates, common on
///   development containers
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub timeout: Duration,
    pub keep_alive: Duration,
    pub skip_tls_verify: bool,
}

impl ProxySettings {
    /// Time allowed to establish an upstream connection.
    ///
    /// reqwest bounds connection setup, TLS included, with a single connect
    /// timeout and has no separate handshake setting, so the handshake
    /// budget is folded into it.
    pub fn connect_budget(&self) -> Duration {
        self.timeout + TLS_HANDSHAKE_TIMEOUT
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            skip_tls_verify: true,
        }
    }
}

/// Builds [`ReverseProxy`] instances that share one connection pool.
#[derive(Clone)]
pub struct ReverseProxyFactory {
    client: Client,
}

impl ReverseProxyFactory {
    pub fn new(settings: &ProxySettings) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_budget())
            .tcp_keepalive(settings.keep_alive)
            .danger_accept_invalid_certs(settings.skip_tls_verify)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ProxyError::Client)?;

        Ok(Self { client })
    }

    /// A proxy for `target` that stamps `overrides` on every request after
    /// the forwarding headers, replacing any header of the same name.
    pub fn build(&self, target: Url, overrides: HeaderMap) -> ReverseProxy {
        ReverseProxy {
            client: self.client.clone(),
            target,
            overrides,
        }
    }

    /// `http://{address}:{port}/`, bracketing IPv6 addresses.
    pub fn endpoint_url(address: &str, port: u16) -> Result<Url, ProxyError> {
        let host = match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
            _ => address.to_string(),
        };
        Url::parse(&format!("http://{host}:{port}/"))
            .map_err(|e| ProxyError::InvalidTarget(format!("{address}:{port}: {e}")))
    }
}

pub struct ReverseProxy {
    client: Client,
    target: Url,
    overrides: HeaderMap,
}

impl ReverseProxy {
    /// Forwards `req` to the target, keeping its path and query, and streams
    /// the upstream response back.
    ///
    /// Upgrade requests keep their `Upgrade` header. When the upstream
    /// switches protocols the 101 is relayed and the two connections are
    /// bridged in a background task until either side closes.
    pub async fn forward(
        &self,
        mut req: Request,
        client_ip: Option<IpAddr>,
    ) -> Result<Response, ProxyError> {
        let upgrade = requested_upgrade(req.headers());
        let client_upgrade = upgrade.is_some().then(|| hyper::upgrade::on(&mut req));

        let (parts, body) = req.into_parts();

        let mut url = self.target.clone();
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());

        let original_host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        let proto = parts
            .headers
            .get(&X_FORWARDED_PROTO)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("http"));

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        if let Some(protocol) = &upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol.clone());
        }

        if let Some(ip) = client_ip {
            if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        headers.insert(X_FORWARDED_PROTO, proto);
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }

        for name in self.overrides.keys() {
            headers.remove(name);
        }
        for (name, value) in &self.overrides {
            headers.append(name.clone(), value.clone());
        }

        debug!(method = %parts.method, url = %url, upgrade = upgrade.is_some(), "forwarding request");

        let mut upstream = self.client.request(parts.method, url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let upstream = upstream.send().await?;

        if upstream.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                return switch_protocols(upstream, client_upgrade).await;
            }
        }

        let mut response = axum::http::Response::builder().status(upstream.status());
        if let Some(response_headers) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                response_headers.append(name.clone(), value.clone());
            }
            strip_hop_by_hop(response_headers);
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ProxyError::InvalidTarget(e.to_string()))
    }
}

/// The protocol a request asks to switch to, when it carries both
/// `Connection: upgrade` and an `Upgrade` header.
fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    headers.get(header::UPGRADE).cloned()
}

/// Relays the upstream's 101 and splices the upgraded connections.
async fn switch_protocols(
    upstream: reqwest::Response,
    client_upgrade: hyper::upgrade::OnUpgrade,
) -> Result<Response, ProxyError> {
    let mut response = axum::http::Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    if let Some(response_headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            response_headers.append(name.clone(), value.clone());
        }
    }
    let response = response
        .body(Body::empty())
        .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;

    let mut upstream_io = upstream.upgrade().await?;

    // The client side completes only after the 101 has been written out.
    tokio::spawn(async move {
        let client_io = match client_upgrade.await {
            Ok(io) => io,
            Err(e) => {
                debug!(error = %e, "client upgrade failed");
                return;
            }
        };
        let mut client_io = TokioIo::new(client_io);
        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            Ok((sent, received)) => debug!(sent, received, "upgraded connection closed"),
            Err(e) => debug!(error = %e, "upgraded connection ended"),
        }
    });

    Ok(response)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
