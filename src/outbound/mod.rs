//! Outbound adapters: the uniform dial contract every proxy satisfies.

mod direct;
mod http;
mod probe;
mod reject;
mod socks5;

pub use direct::Direct;
pub use http::HttpProxy;
pub use probe::probe_url;
pub use reject::Reject;
pub use socks5::Socks5Proxy;

use crate::common::Metadata;
use crate::config::ProxyConfig;
use crate::dns::Resolver;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Delay value meaning "dead or never probed"
pub const DELAY_INFINITE: u16 = 0xFFFF;

/// Adapter kind, for introspection and display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Direct,
    Reject,
    RejectDrop,
    Http,
    Socks5,
    Selector,
    UrlTest,
    Fallback,
    LoadBalance,
    Relay,
}

impl ProxyType {
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            ProxyType::Selector
                | ProxyType::UrlTest
                | ProxyType::Fallback
                | ProxyType::LoadBalance
                | ProxyType::Relay
        )
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Direct => write!(f, "Direct"),
            ProxyType::Reject => write!(f, "Reject"),
            ProxyType::RejectDrop => write!(f, "RejectDrop"),
            ProxyType::Http => write!(f, "HTTP"),
            ProxyType::Socks5 => write!(f, "SOCKS5"),
            ProxyType::Selector => write!(f, "Selector"),
            ProxyType::UrlTest => write!(f, "URLTest"),
            ProxyType::Fallback => write!(f, "Fallback"),
            ProxyType::LoadBalance => write!(f, "LoadBalance"),
            ProxyType::Relay => write!(f, "Relay"),
        }
    }
}

/// Duplex byte stream returned by `dial`
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

impl fmt::Debug for dyn ProxyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProxyStream")
    }
}

/// Packet connection returned by `listen_packet`
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> Result<SocketAddr>;
}

pub type BoxedPacketConn = Box<dyn PacketConn>;

/// Ambient dial parameters, passed explicitly instead of a type-keyed bag
#[derive(Debug, Clone, Default)]
pub struct DialContext {
    /// Bind outgoing sockets to this interface
    pub bind_interface: Option<String>,
    /// SO_MARK for policy routing
    pub routing_mark: Option<u32>,
    /// Proxy names already traversed (relay chains)
    pub chain: Vec<String>,
}

/// Health state shared by every adapter: single writer (health check),
/// many readers (dispatch).
#[derive(Debug)]
pub struct AdapterState {
    alive: AtomicBool,
    delay: AtomicU16,
}

impl Default for AdapterState {
    fn default() -> Self {
        AdapterState {
            alive: AtomicBool::new(true),
            delay: AtomicU16::new(DELAY_INFINITE),
        }
    }
}

impl AdapterState {
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn last_delay(&self) -> u16 {
        self.delay.load(Ordering::Relaxed)
    }

    pub fn record_delay(&self, delay: u16) {
        self.delay.store(delay, Ordering::Relaxed);
        self.alive.store(true, Ordering::Relaxed);
    }

    pub fn mark_dead(&self) {
        self.delay.store(DELAY_INFINITE, Ordering::Relaxed);
        self.alive.store(false, Ordering::Relaxed);
    }
}

/// Uniform outbound contract.
#[async_trait]
pub trait OutboundProxy: Send + Sync {
    fn name(&self) -> &str;

    fn proxy_type(&self) -> ProxyType;

    /// Remote endpoint for protocol adapters; None for sentinels and groups
    fn server_addr(&self) -> Option<(String, u16)> {
        None
    }

    fn support_udp(&self) -> bool;

    fn state(&self) -> &AdapterState;

    fn alive(&self) -> bool {
        self.state().alive()
    }

    /// Last probe RTT in milliseconds; `DELAY_INFINITE` when unknown
    fn last_delay(&self) -> u16 {
        self.state().last_delay()
    }

    /// Open a duplex stream to the metadata destination through this adapter
    async fn dial(&self, ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream>;

    /// Run this adapter's protocol over an already-established transport.
    /// Used by relay chains; sentinels cannot be chained.
    async fn handshake(&self, _stream: BoxedStream, _metadata: &Metadata) -> Result<BoxedStream> {
        Err(Error::unsupported(format!(
            "{} cannot be relayed through",
            self.name()
        )))
    }

    /// UDP contract; adapters without UDP fail with `UdpNotSupported`
    async fn listen_packet(
        &self,
        _ctx: &DialContext,
        _metadata: &Metadata,
    ) -> Result<BoxedPacketConn> {
        Err(Error::UdpNotSupported(self.name().to_string()))
    }

    /// Probe `url` through this adapter and record latency + liveness.
    async fn url_test(&self, url: &str) -> Result<u16> {
        match probe_url(self, url).await {
            Ok(delay) => {
                self.state().record_delay(delay);
                Ok(delay)
            }
            Err(e) => {
                self.state().mark_dead();
                Err(e)
            }
        }
    }

    /// Release held resources; called exactly once on teardown
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Name -> adapter registry. Leaf and group names share one namespace.
#[derive(Default)]
pub struct ProxyRegistry {
    inner: RwLock<HashMap<String, Arc<dyn OutboundProxy>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an adapter; duplicate names are rejected.
    pub fn insert(&self, proxy: Arc<dyn OutboundProxy>) -> Result<()> {
        let name = proxy.name().to_string();
        let mut inner = self.inner.write();
        if inner.contains_key(&name) {
            return Err(Error::config(format!("duplicate proxy name: {}", name)));
        }
        inner.insert(name, proxy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OutboundProxy>> {
        self.inner.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<dyn OutboundProxy>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Late-bound dial hook used by the DNS resolver for proxy-bound upstreams.
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    async fn dial_through(&self, proxy: &str, metadata: &Metadata) -> Result<BoxedStream>;
}

#[async_trait]
impl ProxyDialer for ProxyRegistry {
    async fn dial_through(&self, proxy: &str, metadata: &Metadata) -> Result<BoxedStream> {
        let adapter = self
            .get(proxy)
            .ok_or_else(|| Error::proxy(format!("proxy not found: {}", proxy)))?;
        adapter.dial(&DialContext::default(), metadata).await
    }
}

/// Build a leaf adapter from its config entry.
pub fn build_proxy(config: &ProxyConfig, resolver: Arc<Resolver>) -> Result<Arc<dyn OutboundProxy>> {
    match config.proxy_type.to_lowercase().as_str() {
        "direct" => Ok(Arc::new(Direct::with_resolver(
            config.name.clone(),
            resolver,
        ))),
        "reject" => Ok(Arc::new(Reject::new(config.name.clone(), false))),
        "reject-drop" => Ok(Arc::new(Reject::new(config.name.clone(), true))),
        "http" => Ok(Arc::new(HttpProxy::new(
            config.name.clone(),
            config.server.clone(),
            config.port,
            config.get_string("username"),
            config.get_string("password"),
            config.get_bool("tls").unwrap_or(false),
            config.get_bool("skip-cert-verify").unwrap_or(false),
            resolver,
        ))),
        "socks5" | "socks" => Ok(Arc::new(Socks5Proxy::new(
            config.name.clone(),
            config.server.clone(),
            config.port,
            config.get_string("username"),
            config.get_string("password"),
            config.get_bool("udp").unwrap_or(false),
            resolver,
        ))),
        other => Err(Error::config(format!(
            "proxy {}: unsupported type {}",
            config.name, other
        ))),
    }
}
