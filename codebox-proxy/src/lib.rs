//! Port forwarding for codebox workspaces.
//!
//! Requests for `codebox--{workspace}--{container}--{port}.{wildcard domain}`
//! are resolved through the endpoint registry and proxied to the container.
//! Everything else passes through to the regular API routes.

pub mod error;
pub mod reverse_proxy;
pub mod router;
pub mod subdomain;

pub use error::{ProxyError, RoutingError};
pub use reverse_proxy::{ProxySettings, ReverseProxy, ReverseProxyFactory};
pub use router::{port_forwarding, Decision, ForwardingSettings, PortForwarding};
pub use subdomain::{decode_host, ForwardTarget, SUBDOMAIN_PREFIX};
