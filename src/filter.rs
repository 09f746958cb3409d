//! Exclusion filter for the agent's own management traffic.
//!
//! The management interface carries the agent's connections to the
//! configuration server and to the collector. Capturing those would report
//! the reports themselves, so they are excluded with a BPF expression of the
//! form `not (<server-clause> or <collector-clause>)`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use pcap::{Activated, Capture};
use tracing::{debug, info};
use url::{Host, Url};

use crate::error::FilterError;

/// Upper bound for a single host clause and for the combined expression.
pub const MAX_CLAUSE_LEN: usize = 256;

/// Hostname lookup used to build the filter.
pub trait Resolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the system resolver (getaddrinfo).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        Ok((host, 0)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .collect())
    }
}

/// Host part of an endpoint URL such as `https://config.example.net` or
/// `tcp://[2001:db8::1]:5556`.
pub fn url_host(url: &str) -> Result<Host, FilterError> {
    let parsed = Url::parse(url).map_err(|e| FilterError::InvalidUrl(format!("{}: {}", url, e)))?;

    match parsed.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => Ok(Host::Domain(domain.to_string())),
        Some(Host::Ipv4(addr)) => Ok(Host::Ipv4(addr)),
        Some(Host::Ipv6(addr)) => Ok(Host::Ipv6(addr)),
        _ => Err(FilterError::InvalidUrl(format!("{}: no host", url))),
    }
}

/// First IPv4 and first IPv6 address among `addrs`.
fn pick_addresses(addrs: &[IpAddr]) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let v4 = addrs.iter().find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    });
    let v6 = addrs.iter().find_map(|addr| match addr {
        IpAddr::V6(v6) => Some(*v6),
        IpAddr::V4(_) => None,
    });
    (v4, v6)
}

fn bounded(expression: String) -> Result<String, FilterError> {
    if expression.len() >= MAX_CLAUSE_LEN {
        return Err(FilterError::Truncated {
            len: expression.len(),
            limit: MAX_CLAUSE_LEN,
        });
    }
    Ok(expression)
}

/// Host-match clause for one endpoint URL.
pub fn endpoint_clause(url: &str, resolver: &dyn Resolver) -> Result<String, FilterError> {
    let host = url_host(url)?;
    let addrs = match &host {
        Host::Domain(domain) => resolver.resolve(domain).unwrap_or_else(|e| {
            debug!("Lookup of {} failed: {}", domain, e);
            Vec::new()
        }),
        Host::Ipv4(addr) => vec![IpAddr::V4(*addr)],
        Host::Ipv6(addr) => vec![IpAddr::V6(*addr)],
    };

    let clause = match pick_addresses(&addrs) {
        (Some(v4), Some(v6)) => format!("host {} or ip6 host {}", v4, v6),
        (Some(v4), None) => format!("host {}", v4),
        (None, Some(v6)) => format!("ip6 host {}", v6),
        (None, None) => return Err(FilterError::Unresolved(host.to_string())),
    };

    bounded(clause)
}

/// Build `not (<server-clause> or <collector-clause>)`.
pub fn build_exclusion_expression(
    server_url: &str,
    monitor_url: &str,
    resolver: &dyn Resolver,
) -> Result<String, FilterError> {
    let server = endpoint_clause(server_url, resolver)?;
    let monitor = endpoint_clause(monitor_url, resolver)?;

    bounded(format!("not ({} or {})", server, monitor))
}

/// A filter that has been compiled and installed on a capture handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFilter {
    expression: String,
    instructions: usize,
}

impl CompiledFilter {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Size of the compiled BPF program.
    pub fn instructions(&self) -> usize {
        self.instructions
    }
}

/// Compile `expression` for the handle's link type without installing it.
pub fn compile_filter<T: Activated + ?Sized>(
    capture: &Capture<T>,
    expression: &str,
) -> Result<CompiledFilter, FilterError> {
    let program = capture
        .compile(expression, true)
        .map_err(|e| FilterError::Compile {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

    Ok(CompiledFilter {
        expression: expression.to_string(),
        instructions: program.get_instructions().len(),
    })
}

/// Compile `expression` for the handle's link type and install it.
pub fn compile_and_apply<T: Activated + ?Sized>(
    capture: &mut Capture<T>,
    expression: &str,
) -> Result<CompiledFilter, FilterError> {
    let compiled = compile_filter(capture, expression)?;

    capture
        .filter(expression, true)
        .map_err(|e| FilterError::Install(e.to_string()))?;

    info!(
        "Installed filter '{}' ({} instructions)",
        expression,
        compiled.instructions()
    );

    Ok(compiled)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pcap::{Dead, Linktype};
    use std::collections::HashMap;

    /// Resolver backed by a fixed table.
    pub(crate) struct StaticResolver(pub HashMap<&'static str, Vec<IpAddr>>);

    impl Resolver for StaticResolver {
        fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, host.to_string()))
        }
    }

    pub(crate) fn dead_ethernet() -> Capture<Dead> {
        Capture::dead(Linktype::ETHERNET).unwrap()
    }

    pub(crate) fn resolver() -> StaticResolver {
        let mut table = HashMap::new();
        table.insert(
            "config.example.net",
            vec![
                "2001:db8::10".parse().unwrap(),
                "198.51.100.10".parse().unwrap(),
                "198.51.100.11".parse().unwrap(),
            ],
        );
        table.insert("collector.example.net", vec!["203.0.113.5".parse().unwrap()]);
        table.insert("v6only.example.net", vec!["2001:db8::99".parse().unwrap()]);
        StaticResolver(table)
    }

    fn domain(name: &str) -> Host {
        Host::Domain(name.to_string())
    }

    #[test]
    fn test_url_host() {
        assert_eq!(url_host("https://config.example.net").unwrap(), domain("config.example.net"));
        assert_eq!(
            url_host("https://config.example.net:8443/api/v1").unwrap(),
            domain("config.example.net")
        );
        assert_eq!(
            url_host("tcp://collector.example.net:5556").unwrap(),
            domain("collector.example.net")
        );
        assert_eq!(
            url_host("tcp://[2001:db8::1]:5556").unwrap(),
            Host::<String>::Ipv6("2001:db8::1".parse().unwrap())
        );
        assert_eq!(
            url_host("https://198.51.100.7/").unwrap(),
            Host::<String>::Ipv4("198.51.100.7".parse().unwrap())
        );
        assert_eq!(url_host("http://user@host.example/x").unwrap(), domain("host.example"));
    }

    #[test]
    fn test_url_host_normalises_case() {
        assert_eq!(url_host("https://Config.Example.NET").unwrap(), domain("config.example.net"));
    }

    #[test]
    fn test_url_host_rejects_garbage() {
        assert!(matches!(url_host("config.example.net"), Err(FilterError::InvalidUrl(_))));
        assert!(matches!(url_host("https://"), Err(FilterError::InvalidUrl(_))));
        assert!(matches!(url_host("tcp://[::1:5556"), Err(FilterError::InvalidUrl(_))));
        assert!(matches!(
            url_host("tcp://[2001:db8::1]junk:1"),
            Err(FilterError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_ip_literal_needs_no_lookup() {
        let empty = StaticResolver(HashMap::new());
        assert_eq!(
            endpoint_clause("tcp://[2001:db8::5]:5556", &empty).unwrap(),
            "ip6 host 2001:db8::5"
        );
        assert_eq!(
            endpoint_clause("https://198.51.100.7", &empty).unwrap(),
            "host 198.51.100.7"
        );
    }

    #[test]
    fn test_clause_for_dual_stack_host() {
        let clause = endpoint_clause("https://config.example.net", &resolver()).unwrap();
        assert_eq!(clause, "host 198.51.100.10 or ip6 host 2001:db8::10");
    }

    #[test]
    fn test_clause_for_single_family() {
        let resolver = resolver();
        assert_eq!(
            endpoint_clause("tcp://collector.example.net:5556", &resolver).unwrap(),
            "host 203.0.113.5"
        );
        assert_eq!(
            endpoint_clause("tcp://v6only.example.net:5556", &resolver).unwrap(),
            "ip6 host 2001:db8::99"
        );
    }

    #[test]
    fn test_expression_combines_both_endpoints() {
        let expression = build_exclusion_expression(
            "https://config.example.net",
            "tcp://collector.example.net:5556",
            &resolver(),
        )
        .unwrap();
        assert_eq!(
            expression,
            "not (host 198.51.100.10 or ip6 host 2001:db8::10 or host 203.0.113.5)"
        );
    }

    #[test]
    fn test_expression_is_deterministic() {
        let resolver = resolver();
        let build = || {
            build_exclusion_expression(
                "https://config.example.net",
                "tcp://v6only.example.net:5556",
                &resolver,
            )
            .unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_unresolved_endpoint_fails() {
        let err = build_exclusion_expression(
            "https://config.example.net",
            "tcp://unknown.example.net:5556",
            &resolver(),
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::Unresolved(host) if host == "unknown.example.net"));
    }

    #[test]
    fn test_longest_clause_fits() {
        let mut table = HashMap::new();
        table.insert(
            "a.example",
            vec![
                "1111:2222:3333:4444:5555:6666:7777:8888".parse().unwrap(),
                "255.255.255.255".parse().unwrap(),
            ],
        );
        let clause = endpoint_clause("https://a.example", &StaticResolver(table)).unwrap();
        assert!(clause.len() < MAX_CLAUSE_LEN);
    }

    #[test]
    fn test_oversized_expression_is_reported() {
        let long = "x".repeat(MAX_CLAUSE_LEN);
        assert!(matches!(
            bounded(long),
            Err(FilterError::Truncated { len: MAX_CLAUSE_LEN, limit: MAX_CLAUSE_LEN })
        ));
        assert!(bounded("x".repeat(MAX_CLAUSE_LEN - 1)).is_ok());
    }

    #[test]
    fn test_ip_literal_resolves_through_system_resolver() {
        let clause = endpoint_clause("tcp://127.0.0.1:5556", &SystemResolver).unwrap();
        assert_eq!(clause, "host 127.0.0.1");
    }

    #[test]
    fn test_exclusion_expression_compiles() {
        let expression = build_exclusion_expression(
            "https://config.example.net",
            "tcp://collector.example.net:5556",
            &resolver(),
        )
        .unwrap();

        let compiled = compile_filter(&dead_ethernet(), &expression).unwrap();
        assert_eq!(compiled.expression(), expression);
        assert!(compiled.instructions() > 0);
    }

    #[test]
    fn test_compile_rejects_malformed_expression() {
        let err = compile_filter(&dead_ethernet(), "not (((").unwrap_err();
        assert!(matches!(err, FilterError::Compile { expression, .. } if expression == "not ((("));
    }
}
