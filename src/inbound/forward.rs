//! Static tunnels: local listeners bound to a fixed target and proxy.

use super::InboundListener;
use crate::common::{Metadata, SourceType};
use crate::config::ParsedTunnel;
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

pub struct TunnelListener {
    spec: ParsedTunnel,
    tunnel: Arc<Tunnel>,
}

impl TunnelListener {
    pub fn new(spec: ParsedTunnel, tunnel: Arc<Tunnel>) -> Self {
        TunnelListener { spec, tunnel }
    }

    fn target(&self) -> Result<(String, Option<IpAddr>, u16)> {
        let (host, port) = self
            .spec
            .target
            .rsplit_once(':')
            .ok_or_else(|| Error::config(format!("tunnel target {}: missing port", self.spec.target)))?;
        let port = port
            .parse()
            .map_err(|_| Error::config(format!("tunnel target {}: bad port", self.spec.target)))?;
        match host.parse::<IpAddr>() {
            Ok(ip) => Ok((String::new(), Some(ip), port)),
            Err(_) => Ok((host.to_string(), None, port)),
        }
    }

    fn metadata(&self, network: crate::common::Network, peer: SocketAddr) -> Result<Metadata> {
        let (host, ip, port) = self.target()?;
        let mut metadata = Metadata::new(network, SourceType::Inner)
            .with_source(peer)
            .with_dst_port(port);
        metadata.host = host;
        metadata.dst_ip = ip;
        metadata.special_proxy = Some(self.spec.proxy.clone());
        Ok(metadata)
    }

    async fn run_tcp(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.spec.address)
            .await
            .map_err(|e| Error::connection(format!("bind {}: {}", self.spec.address, e)))?;
        info!(
            "tunnel tcp {} -> {} via {}",
            self.spec.address, self.spec.target, self.spec.proxy
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("tunnel accept: {}", e);
                    continue;
                }
            };
            let metadata = match self.metadata(crate::common::Network::Tcp, peer) {
                Ok(m) => m,
                Err(e) => {
                    warn!("tunnel metadata: {}", e);
                    continue;
                }
            };
            let tunnel = self.tunnel.clone();
            tokio::spawn(async move {
                tunnel.handle_stream(metadata, stream).await;
            });
        }
    }

    async fn run_udp(&self) -> Result<()> {
        let socket = Arc::new(
            UdpSocket::bind(&self.spec.address)
                .await
                .map_err(|e| Error::connection(format!("bind {}: {}", self.spec.address, e)))?,
        );
        info!(
            "tunnel udp {} -> {} via {}",
            self.spec.address, self.spec.target, self.spec.proxy
        );

        let mut metadata = self.metadata(crate::common::Network::Udp, socket.local_addr()?)?;
        let (conn, _proxy) = self.tunnel.connect_packet(&mut metadata).await?;
        self.tunnel.resolve_metadata(&mut metadata).await?;
        let target = metadata
            .dst_ip
            .map(|ip| SocketAddr::new(ip, metadata.dst_port))
            .ok_or_else(|| Error::address("tunnel target unresolved"))?;

        let conn = Arc::new(conn);

        // Reply pump: answers go back to the most recent client
        let reply_socket = socket.clone();
        let reply_conn = conn.clone();
        let last_client = Arc::new(parking_lot::Mutex::new(None::<SocketAddr>));
        let reply_last = last_client.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match reply_conn.recv_from(&mut buf).await {
                    Ok((n, _)) => {
                        let client = *reply_last.lock();
                        if let Some(client) = client {
                            let _ = reply_socket.send_to(&buf[..n], client).await;
                        }
                    }
                    Err(e) => {
                        debug!("tunnel udp reply pump ended: {}", e);
                        return;
                    }
                }
            }
        });

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            *last_client.lock() = Some(peer);
            if let Err(e) = conn.send_to(&buf[..n], target).await {
                debug!("tunnel udp forward: {}", e);
            }
        }
    }
}

#[async_trait]
impl InboundListener for TunnelListener {
    fn name(&self) -> &str {
        "tunnel"
    }

    async fn start(&self) -> Result<()> {
        let tcp = self.spec.networks.iter().any(|n| n == "tcp");
        let udp = self.spec.networks.iter().any(|n| n == "udp");

        match (tcp, udp) {
            (true, true) => {
                tokio::try_join!(self.run_tcp(), self.run_udp())?;
                Ok(())
            }
            (true, false) => self.run_tcp().await,
            (false, true) => self.run_udp().await,
            (false, false) => Err(Error::config("tunnel with no networks")),
        }
    }
}
