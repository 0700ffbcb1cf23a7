use codebox_config::ResolverSettings;
use codebox_orchestrator::OrchestratorSettings;
use codebox_proxy::{ForwardingSettings, ProxySettings};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_wildcard_domain")]
    pub wildcard_domain: String,

    #[serde(default = "default_auth_cookie_name")]
    pub auth_cookie_name: String,

    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_objects_prefix")]
    pub workspace_objects_prefix: String,

    #[serde(default = "default_agent_binary")]
    pub agent_binary: Option<PathBuf>,

    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,

    #[serde(default = "default_proxy_keepalive")]
    pub proxy_keepalive_secs: u64,

    #[serde(default = "default_proxy_skip_tls_verify")]
    pub proxy_skip_tls_verify: bool,

    /// `name=value` pairs stamped on every forwarded request.
    #[serde(default = "default_forward_headers")]
    pub proxy_forward_headers: Vec<(String, String)>,

    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,

    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    #[serde(default = "default_agent_monitor_interval")]
    pub agent_monitor_interval_secs: u64,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    std::env::var("CODEBOX_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

fn default_data_dir() -> PathBuf {
    std::env::var("CODEBOX_DATA_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

fn default_db_path() -> PathBuf {
    std::env::var("CODEBOX_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_data_dir().join("codebox.db"))
}

fn default_wildcard_domain() -> String {
    std::env::var("CODEBOX_WILDCARD_DOMAIN").unwrap_or_else(|_| "localhost".to_string())
}

fn default_auth_cookie_name() -> String {
    std::env::var("CODEBOX_AUTH_COOKIE_NAME").unwrap_or_else(|_| "codebox_auth_token".to_string())
}

fn default_worker_pool_size() -> usize {
    env_or::<usize>("CODEBOX_WORKSPACE_CONCURRENCY", 1).max(1)
}

fn default_objects_prefix() -> String {
    std::env::var("CODEBOX_WORKSPACE_OBJECTS_PREFIX").unwrap_or_else(|_| "codebox".to_string())
}

fn default_agent_binary() -> Option<PathBuf> {
    std::env::var("CODEBOX_AGENT_BINARY")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn default_proxy_timeout() -> u64 {
    env_or("CODEBOX_PROXY_TIMEOUT", 30)
}

fn default_proxy_keepalive() -> u64 {
    env_or("CODEBOX_PROXY_KEEPALIVE", 30)
}

fn default_proxy_skip_tls_verify() -> bool {
    env_or("CODEBOX_PROXY_SKIP_TLS_VERIFY", true)
}

fn default_forward_headers() -> Vec<(String, String)> {
    std::env::var("CODEBOX_PROXY_FORWARD_HEADERS")
        .map(|raw| parse_header_pairs(&raw))
        .unwrap_or_default()
}

fn default_clone_timeout() -> u64 {
    env_or("CODEBOX_CLONE_TIMEOUT", 300)
}

fn default_log_capacity() -> usize {
    env_or("CODEBOX_WORKSPACE_LOG_CAPACITY", 1000)
}

fn default_agent_monitor_interval() -> u64 {
    env_or("CODEBOX_AGENT_MONITOR_INTERVAL", 120)
}

/// Parses `name=value,name2=value2`; entries without `=` are skipped.
pub fn parse_header_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            db_path: default_db_path(),
            wildcard_domain: default_wildcard_domain(),
            auth_cookie_name: default_auth_cookie_name(),
            worker_pool_size: default_worker_pool_size(),
            workspace_objects_prefix: default_objects_prefix(),
            agent_binary: default_agent_binary(),
            proxy_timeout_secs: default_proxy_timeout(),
            proxy_keepalive_secs: default_proxy_keepalive(),
            proxy_skip_tls_verify: default_proxy_skip_tls_verify(),
            proxy_forward_headers: default_forward_headers(),
            clone_timeout_secs: default_clone_timeout(),
            log_capacity: default_log_capacity(),
            agent_monitor_interval_secs: default_agent_monitor_interval(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("logs").join("codebox.log")
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn agent_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.agent_monitor_interval_secs.max(1))
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            objects_prefix: self.workspace_objects_prefix.clone(),
            worker_pool_size: self.worker_pool_size.max(1),
            agent_binary: self.agent_binary.clone(),
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            data_dir: self.data_dir.clone(),
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            timeout: Duration::from_secs(self.proxy_timeout_secs),
            keep_alive: Duration::from_secs(self.proxy_keepalive_secs),
            skip_tls_verify: self.proxy_skip_tls_verify,
        }
    }

    pub fn forwarding_settings(&self) -> ForwardingSettings {
        ForwardingSettings {
            wildcard_domain: self.wildcard_domain.clone(),
            auth_cookie_name: self.auth_cookie_name.clone(),
            forward_headers: self.proxy_forward_headers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_pairs() {
        assert_eq!(
            parse_header_pairs("X-Codebox=1, x-forwarded-proto = https,broken,=x"),
            vec![
                ("X-Codebox".to_string(), "1".to_string()),
                ("x-forwarded-proto".to_string(), "https".to_string()),
            ]
        );
        assert!(parse_header_pairs("").is_empty());
    }

    #[test]
    fn test_settings_are_derived_from_config() {
        let config = Config {
            worker_pool_size: 0,
            proxy_timeout_secs: 5,
            wildcard_domain: "ws.example.com".to_string(),
            ..Config::default()
        };

        assert_eq!(config.orchestrator_settings().worker_pool_size, 1);
        assert_eq!(config.proxy_settings().timeout, Duration::from_secs(5));
        assert_eq!(
            config.forwarding_settings().wildcard_domain,
            "ws.example.com"
        );
        assert_eq!(
            config.resolver_settings().data_dir,
            config.data_dir
        );
    }
}
