//! Direct outbound (no proxy)

use super::{
    AdapterState, BoxedPacketConn, BoxedStream, DialContext, OutboundProxy, PacketConn, ProxyType,
};
use crate::common::Metadata;
use crate::dns::Resolver;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Direct connection to the destination
pub struct Direct {
    name: String,
    resolver: Option<Arc<Resolver>>,
    state: AdapterState,
}

impl Direct {
    pub fn new() -> Self {
        Self::with_name("DIRECT")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Direct {
            name: name.into(),
            resolver: None,
            state: AdapterState::default(),
        }
    }

    /// Resolve hostnames through the embedded resolver instead of the OS.
    pub fn with_resolver(name: impl Into<String>, resolver: Arc<Resolver>) -> Self {
        Direct {
            name: name.into(),
            resolver: Some(resolver),
            state: AdapterState::default(),
        }
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

struct DirectPacket {
    socket: UdpSocket,
}

#[async_trait]
impl PacketConn for DirectPacket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(buf, addr).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl OutboundProxy for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Direct
    }

    fn support_udp(&self) -> bool {
        true
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, _ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        // Prefer the embedded resolver so hosts recovered from fake IPs
        // get real addresses
        let stream = match (metadata.dst_ip, &self.resolver) {
            (Some(ip), _) => {
                let addr = SocketAddr::new(ip, metadata.dst_port);
                debug!("direct dial {}", addr);
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::connection(format!("connect {}: {}", addr, e)))?
            }
            (None, Some(resolver)) if !metadata.host.is_empty() => {
                let ip = resolver.resolve_ip(&metadata.host).await?;
                let addr = SocketAddr::new(ip, metadata.dst_port);
                debug!("direct dial {} ({})", addr, metadata.host);
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::connection(format!("connect {}: {}", addr, e)))?
            }
            _ => {
                let addr = metadata.remote_address();
                debug!("direct dial {}", addr);
                TcpStream::connect(&addr)
                    .await
                    .map_err(|e| Error::connection(format!("connect {}: {}", addr, e)))?
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn listen_packet(
        &self,
        _ctx: &DialContext,
        metadata: &Metadata,
    ) -> Result<BoxedPacketConn> {
        let bind: SocketAddr = if metadata.src_ip.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Box::new(DirectPacket { socket }))
    }
}
