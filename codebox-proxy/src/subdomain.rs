//! Decoding of forwarding hostnames:
//! `codebox--{workspace id}--{container}--{port}.{wildcard domain}`.

use crate::error::RoutingError;

pub const SUBDOMAIN_PREFIX: &str = "codebox--";
const SEPARATOR: &str = "--";

/// Where a forwarding request wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub workspace_id: i64,
    pub container: String,
    pub port: u16,
}

/// The split label, before its numbers are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTarget<'a> {
    pub workspace_id: &'a str,
    pub container: &'a str,
    pub port: &'a str,
}

impl RawTarget<'_> {
    pub fn parse(&self) -> Result<ForwardTarget, RoutingError> {
        let workspace_id = parse_digits::<i64>(self.workspace_id)
            .filter(|id| *id > 0)
            .ok_or_else(|| RoutingError::InvalidWorkspaceId(self.workspace_id.to_string()))?;

        let port = parse_digits::<u16>(self.port)
            .filter(|port| *port > 0)
            .ok_or_else(|| RoutingError::InvalidPort(self.port.to_string()))?;

        Ok(ForwardTarget {
            workspace_id,
            container: self.container.to_string(),
            port,
        })
    }
}

/// Unsigned base-10 only; `str::parse` would also take a leading `+`.
fn parse_digits<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Strips an optional `:port` from a Host header value.
pub fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Splits a request host into its forwarding label.
///
/// `Ok(None)` means the host is not under the wildcard domain and the
/// request is not a forwarding request at all.
pub fn decode_host<'a>(
    host: &'a str,
    wildcard_domain: &str,
) -> Result<Option<RawTarget<'a>>, RoutingError> {
    let wildcard_domain = wildcard_domain.trim_matches('.');
    if wildcard_domain.is_empty() {
        return Ok(None);
    }

    let host = host_without_port(host).trim_end_matches('.');
    let Some(labels) = strip_suffix_ignore_case(host, wildcard_domain)
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return Ok(None);
    };

    let label = labels.rsplit('.').next().unwrap_or_default();
    if !starts_with_ignore_case(label, SUBDOMAIN_PREFIX) {
        return Err(RoutingError::MissingPrefix);
    }

    let parts: Vec<&str> = label.split(SEPARATOR).collect();
    match parts.as_slice() {
        [_, workspace_id, container, port] => Ok(Some(RawTarget {
            workspace_id,
            container,
            port,
        })),
        _ => Err(RoutingError::PartCount(parts.len())),
    }
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let split = s.len().checked_sub(suffix.len())?;
    if !s.is_char_boundary(split) {
        return None;
    }
    let (head, tail) = s.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then_some(head)
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "ws.example.com";

    fn decode(host: &str) -> Result<Option<ForwardTarget>, RoutingError> {
        decode_host(host, DOMAIN).and_then(|raw| raw.map(|r| r.parse()).transpose())
    }

    #[test]
    fn test_valid_subdomain() {
        let target = decode("codebox--42--development--3000.ws.example.com")
            .unwrap()
            .unwrap();
        assert_eq!(
            target,
            ForwardTarget {
                workspace_id: 42,
                container: "development".to_string(),
                port: 3000,
            }
        );
    }

    #[test]
    fn test_host_port_and_case_are_ignored() {
        let target = decode("Codebox--7--db--5432.WS.Example.com:8080")
            .unwrap()
            .unwrap();
        assert_eq!(target.workspace_id, 7);
        assert_eq!(target.container, "db");
        assert_eq!(target.port, 5432);
    }

    #[test]
    fn test_only_last_label_counts() {
        let target = decode("anything.codebox--1--web--80.ws.example.com")
            .unwrap()
            .unwrap();
        assert_eq!(target.port, 80);
    }

    #[test]
    fn test_other_hosts_pass_through() {
        assert_eq!(decode("ws.example.com").unwrap(), None);
        assert_eq!(decode("api.other.com").unwrap(), None);
        assert_eq!(decode("localhost:8080").unwrap(), None);
        assert_eq!(decode("evilws.example.com").unwrap(), None);
        assert_eq!(decode_host("codebox--1--a--80.x", "").unwrap(), None);
    }

    #[test]
    fn test_malformed_subdomains_are_rejected() {
        let cases = [
            ("www.ws.example.com", RoutingError::MissingPrefix),
            ("codebox-1--a--80.ws.example.com", RoutingError::MissingPrefix),
            ("codebox--1--a.ws.example.com", RoutingError::PartCount(3)),
            ("codebox--1--a--b--80.ws.example.com", RoutingError::PartCount(5)),
        ];
        for (host, expected) in cases {
            assert_eq!(decode(host).unwrap_err(), expected, "{host}");
        }
    }

    #[test]
    fn test_numbers_are_checked() {
        for host in [
            "codebox--0--a--80.ws.example.com",
            "codebox---1--a--80.ws.example.com",
            "codebox--+1--a--80.ws.example.com",
            "codebox--x--a--80.ws.example.com",
            "codebox----a--80.ws.example.com",
        ] {
            assert!(
                matches!(decode(host), Err(RoutingError::InvalidWorkspaceId(_))
                    | Err(RoutingError::PartCount(_))),
                "{host}"
            );
        }

        for port in ["0", "65536", "99999", "-1", "+80", "http", ""] {
            let host = format!("codebox--1--a--{port}.ws.example.com");
            assert_eq!(
                decode(&host).unwrap_err(),
                RoutingError::InvalidPort(port.to_string()),
                "{host}"
            );
        }

        assert_eq!(
            decode("codebox--1--a--65535.ws.example.com")
                .unwrap()
                .unwrap()
                .port,
            65535
        );
        assert_eq!(
            decode("codebox--1--a--1.ws.example.com").unwrap().unwrap().port,
            1
        );
    }

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("example.com:443"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("[::1]:8080"), "[::1]");
    }
}
