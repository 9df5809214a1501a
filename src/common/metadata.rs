//! Connection metadata

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "TCP"),
            Network::Udp => write!(f, "UDP"),
        }
    }
}

/// Where the connection entered the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    Http,
    Socks,
    Redir,
    Tproxy,
    Tun,
    Mitm,
    Inner,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Http => write!(f, "HTTP"),
            SourceType::Socks => write!(f, "SOCKS"),
            SourceType::Redir => write!(f, "Redir"),
            SourceType::Tproxy => write!(f, "TProxy"),
            SourceType::Tun => write!(f, "TUN"),
            SourceType::Mitm => write!(f, "MITM"),
            SourceType::Inner => write!(f, "Inner"),
        }
    }
}

/// How the destination host was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DnsMode {
    #[default]
    Normal,
    FakeIp,
    Mapping,
    Hosts,
}

/// Per-connection record input to classification.
///
/// At least one of `host` or `dst_ip` is set by the time the rule engine
/// sees it; on-demand resolution during classification fills `dst_ip`.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,
    pub source_type: SourceType,
    pub src_ip: IpAddr,
    pub src_port: u16,
    /// Destination host; may be empty when only the IP is known
    pub host: String,
    /// Destination IP; optional until resolution
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub process: Option<String>,
    pub process_path: Option<String>,
    pub uid: Option<u32>,
    pub dns_mode: DnsMode,
    /// Bypass rules and dispatch straight to this proxy
    pub special_proxy: Option<String>,
}

impl Metadata {
    pub fn new(network: Network, source_type: SourceType) -> Self {
        Metadata {
            network,
            source_type,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            host: String::new(),
            dst_ip: None,
            dst_port: 0,
            process: None,
            process_path: None,
            uid: None,
            dns_mode: DnsMode::Normal,
            special_proxy: None,
        }
    }

    pub fn tcp(source_type: SourceType) -> Self {
        Self::new(Network::Tcp, source_type)
    }

    pub fn udp(source_type: SourceType) -> Self {
        Self::new(Network::Udp, source_type)
    }

    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.src_ip = addr.ip();
        self.src_port = addr.port();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_dst_ip(mut self, ip: IpAddr) -> Self {
        self.dst_ip = Some(ip);
        self
    }

    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    /// Whether the destination IP is known
    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// Address string used for dialing, preferring the hostname
    pub fn remote_address(&self) -> String {
        if !self.host.is_empty() {
            format!("{}:{}", self.host, self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            SocketAddr::new(ip, self.dst_port).to_string()
        } else {
            format!("0.0.0.0:{}", self.dst_port)
        }
    }

    pub fn source_detail(&self) -> String {
        let mut detail = format!("{}:{}", self.src_ip, self.src_port);
        if let Some(ref process) = self.process {
            detail.push_str(&format!(" ({})", process));
        }
        detail
    }

    /// Valid for classification: a port plus a host or an IP
    pub fn valid(&self) -> bool {
        self.dst_port > 0 && (!self.host.is_empty() || self.dst_ip.is_some())
    }

    /// Copy without process info, used when dialing nested connections
    pub fn pure(&self) -> Self {
        Metadata {
            process: None,
            process_path: None,
            uid: None,
            special_proxy: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} --> {}",
            self.network,
            self.source_detail(),
            self.remote_address()
        )
    }
}
