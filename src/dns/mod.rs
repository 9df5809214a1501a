//! Embedded recursive DNS resolver.
//!
//! Satisfies client lookups and drives classification: fake-IP mapping,
//! policy routing across heterogeneous upstreams, and GeoIP/GeoSite
//! fallback arbitration.

mod cache;
mod dhcp;
mod doh;
pub mod fakeip;
mod resolver;
mod server;
mod upstream;

pub use cache::DnsCache;
pub use fakeip::FakeIpPool;
pub use resolver::{EnhancedMode, Resolver};
pub use server::{serve_query, DnsServer};
pub use upstream::{answer_ips, batch_exchange, build_query, DnsUpstream};

use crate::outbound::{BoxedStream, ProxyDialer};
use crate::{Error, Result};
use once_cell::sync::OnceCell;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default per-upstream exchange budget
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Udp,
    Tcp,
    Tls,
    Https,
    Http3,
    Dhcp,
}

/// Parsed nameserver specification.
///
/// Formats: `8.8.8.8`, `8.8.8.8:53`, `udp://…`, `tcp://…`, `tls://…`,
/// `https://…/dns-query`, `h3://…`, `dhcp://en0`. A `#name` suffix routes
/// the upstream through the named proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServer {
    pub kind: UpstreamKind,
    pub host: String,
    pub port: u16,
    /// URL path for DoH/DoH3
    pub path: String,
    /// Route this upstream through a named proxy
    pub proxy: Option<String>,
    /// Interface hint (DHCP-derived upstreams)
    pub interface: Option<String>,
}

impl NameServer {
    pub fn parse(spec: &str) -> Result<Self> {
        let (spec, proxy) = match spec.split_once('#') {
            Some((s, p)) if !p.is_empty() => (s, Some(p.to_string())),
            _ => (spec, None),
        };

        let (scheme, rest) = match spec.split_once("://") {
            Some((s, r)) => (s, r),
            None => ("udp", spec),
        };

        let (kind, default_port) = match scheme {
            "udp" => (UpstreamKind::Udp, 53),
            "tcp" => (UpstreamKind::Tcp, 53),
            "tls" => (UpstreamKind::Tls, 853),
            "https" => (UpstreamKind::Https, 443),
            "h3" => (UpstreamKind::Http3, 443),
            "dhcp" => {
                return Ok(NameServer {
                    kind: UpstreamKind::Dhcp,
                    host: String::new(),
                    port: 0,
                    path: String::new(),
                    proxy,
                    interface: Some(rest.to_string()),
                })
            }
            other => return Err(Error::config(format!("unknown dns scheme: {}", other))),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (
                rest,
                if matches!(kind, UpstreamKind::Https | UpstreamKind::Http3) {
                    "/dns-query".to_string()
                } else {
                    String::new()
                },
            ),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if p.parse::<u16>().is_ok() && !h.contains(':') => {
                (h.to_string(), p.parse().unwrap_or(default_port))
            }
            _ => (authority.to_string(), default_port),
        };

        if host.is_empty() {
            return Err(Error::config(format!("invalid nameserver: {}", spec)));
        }

        Ok(NameServer {
            kind,
            host,
            port,
            path,
            proxy,
            interface: None,
        })
    }

    /// Whether this upstream needs name resolution before first use
    pub fn needs_bootstrap(&self) -> bool {
        self.host.parse::<IpAddr>().is_err() && self.kind != UpstreamKind::Dhcp
    }
}

/// Ambient values for a single DNS exchange, passed explicitly.
#[derive(Debug, Clone, Default)]
pub struct DnsContext {
    /// Route this exchange through a named proxy, overriding the
    /// upstream's own binding
    pub proxy: Option<String>,
    /// The query resolves an outbound proxy endpoint
    pub proxy_server: bool,
}

/// Transport dialer shared by upstream clients. The proxy hook is bound
/// late, after the adapter registry exists.
#[derive(Default)]
pub struct DnsDialer {
    proxy_dialer: OnceCell<Arc<dyn ProxyDialer>>,
}

impl DnsDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_proxy_dialer(&self, dialer: Arc<dyn ProxyDialer>) {
        let _ = self.proxy_dialer.set(dialer);
    }

    /// Open a TCP-ish stream to `addr`, optionally through a proxy.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        proxy: Option<&str>,
    ) -> Result<BoxedStream> {
        match proxy {
            None => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            Some(name) => {
                let dialer = self
                    .proxy_dialer
                    .get()
                    .ok_or_else(|| Error::dns("proxy dialer not yet bound"))?;
                let metadata = crate::common::Metadata::tcp(crate::common::SourceType::Inner)
                    .with_dst_ip(addr.ip())
                    .with_dst_port(addr.port());
                dialer.dial_through(name, &metadata).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_ip() {
        let ns = NameServer::parse("8.8.8.8").unwrap();
        assert_eq!(ns.kind, UpstreamKind::Udp);
        assert_eq!(ns.host, "8.8.8.8");
        assert_eq!(ns.port, 53);
        assert!(!ns.needs_bootstrap());
    }

    #[test]
    fn test_parse_tls_with_port() {
        let ns = NameServer::parse("tls://dns.google:8853").unwrap();
        assert_eq!(ns.kind, UpstreamKind::Tls);
        assert_eq!(ns.port, 8853);
        assert!(ns.needs_bootstrap());
    }

    #[test]
    fn test_parse_doh_with_proxy() {
        let ns = NameServer::parse("https://dns.google/dns-query#Proxy").unwrap();
        assert_eq!(ns.kind, UpstreamKind::Https);
        assert_eq!(ns.path, "/dns-query");
        assert_eq!(ns.proxy.as_deref(), Some("Proxy"));
    }

    #[test]
    fn test_parse_doh_default_path() {
        let ns = NameServer::parse("h3://1.1.1.1").unwrap();
        assert_eq!(ns.kind, UpstreamKind::Http3);
        assert_eq!(ns.path, "/dns-query");
        assert_eq!(ns.port, 443);
    }

    #[test]
    fn test_parse_dhcp() {
        let ns = NameServer::parse("dhcp://en0").unwrap();
        assert_eq!(ns.kind, UpstreamKind::Dhcp);
        assert_eq!(ns.interface.as_deref(), Some("en0"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NameServer::parse("quic://x").is_err());
    }
}
