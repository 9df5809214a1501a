//! SOCKS5 proxy outbound (RFC 1928), TCP CONNECT and UDP ASSOCIATE.

use super::{
    AdapterState, BoxedPacketConn, BoxedStream, DialContext, OutboundProxy, PacketConn, ProxyType,
};
use crate::common::Metadata;
use crate::dns::Resolver;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

/// SOCKS5 proxy outbound
pub struct Socks5Proxy {
    name: String,
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    udp: bool,
    resolver: Arc<Resolver>,
    state: AdapterState,
}

impl Socks5Proxy {
    pub fn new(
        name: String,
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        udp: bool,
        resolver: Arc<Resolver>,
    ) -> Self {
        Socks5Proxy {
            name,
            server,
            port,
            username,
            password,
            udp,
            resolver,
            state: AdapterState::default(),
        }
    }

    async fn connect_server(&self) -> Result<TcpStream> {
        let addr: SocketAddr = if let Ok(ip) = self.server.parse() {
            SocketAddr::new(ip, self.port)
        } else {
            let ip = self.resolver.resolve_proxy_server(&self.server).await?;
            SocketAddr::new(ip, self.port)
        };

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("connect {}", addr)))?
            .map_err(|e| Error::connection(format!("connect {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        let use_auth = self.username.is_some() && self.password.is_some();
        let greeting: &[u8] = if use_auth {
            &[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_NONE]
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS5_VERSION {
            return Err(Error::protocol("invalid SOCKS5 version"));
        }

        match choice[1] {
            AUTH_NONE => Ok(()),
            AUTH_PASSWORD if use_auth => {
                // RFC 1929 username/password subnegotiation
                let user = self.username.as_deref().unwrap_or_default().as_bytes();
                let pass = self.password.as_deref().unwrap_or_default().as_bytes();
                let mut req = Vec::with_capacity(3 + user.len() + pass.len());
                req.push(0x01);
                req.push(user.len() as u8);
                req.extend_from_slice(user);
                req.push(pass.len() as u8);
                req.extend_from_slice(pass);
                stream.write_all(&req).await?;

                let mut resp = [0u8; 2];
                stream.read_exact(&mut resp).await?;
                if resp[1] != 0 {
                    return Err(Error::protocol("SOCKS5 authentication failed"));
                }
                Ok(())
            }
            _ => Err(Error::protocol("no acceptable SOCKS5 auth method")),
        }
    }

    fn encode_addr(buf: &mut Vec<u8>, metadata: &Metadata) {
        if !metadata.host.is_empty() {
            buf.push(ATYP_DOMAIN);
            buf.push(metadata.host.len() as u8);
            buf.extend_from_slice(metadata.host.as_bytes());
        } else {
            match metadata.dst_ip {
                Some(IpAddr::V4(ip)) => {
                    buf.push(ATYP_IPV4);
                    buf.extend_from_slice(&ip.octets());
                }
                Some(IpAddr::V6(ip)) => {
                    buf.push(ATYP_IPV6);
                    buf.extend_from_slice(&ip.octets());
                }
                None => {
                    buf.push(ATYP_IPV4);
                    buf.extend_from_slice(&[0, 0, 0, 0]);
                }
            }
        }
        buf.extend_from_slice(&metadata.dst_port.to_be_bytes());
    }

    async fn request<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        cmd: u8,
        metadata: &Metadata,
    ) -> Result<SocketAddr> {
        let mut req = vec![SOCKS5_VERSION, cmd, 0x00];
        Self::encode_addr(&mut req, metadata);
        stream.write_all(&req).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != REP_SUCCESS {
            return Err(Error::connection(format!("SOCKS5 reply code {}", head[1])));
        }

        // Bound address in the reply
        let bound = match head[3] {
            ATYP_IPV4 => {
                let mut raw = [0u8; 6];
                stream.read_exact(&mut raw).await?;
                let ip = IpAddr::from([raw[0], raw[1], raw[2], raw[3]]);
                SocketAddr::new(ip, u16::from_be_bytes([raw[4], raw[5]]))
            }
            ATYP_IPV6 => {
                let mut raw = [0u8; 18];
                stream.read_exact(&mut raw).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[..16]);
                SocketAddr::new(IpAddr::from(octets), u16::from_be_bytes([raw[16], raw[17]]))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut raw = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut raw).await?;
                // Domains in replies are rare; callers only need a port
                let port = u16::from_be_bytes([raw[len[0] as usize], raw[len[0] as usize + 1]]);
                SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port)
            }
            other => {
                return Err(Error::protocol(format!("bad reply address type {}", other)))
            }
        };

        Ok(bound)
    }
}

/// UDP relay socket wrapping datagrams in SOCKS5 UDP headers.
///
/// The TCP control connection is held open: dropping it tells the server to
/// release the association.
struct Socks5Packet {
    socket: UdpSocket,
    relay: SocketAddr,
    _control: TcpStream,
}

#[async_trait]
impl PacketConn for Socks5Packet {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        let mut packet = vec![0x00, 0x00, 0x00];
        match addr.ip() {
            IpAddr::V4(ip) => {
                packet.push(ATYP_IPV4);
                packet.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                packet.push(ATYP_IPV6);
                packet.extend_from_slice(&ip.octets());
            }
        }
        packet.extend_from_slice(&addr.port().to_be_bytes());
        packet.extend_from_slice(buf);

        self.socket.send_to(&packet, self.relay).await?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut raw = vec![0u8; buf.len() + 262];
        loop {
            let (n, _) = self.socket.recv_from(&mut raw).await?;
            if n < 10 || raw[2] != 0 {
                continue; // fragmented or malformed
            }
            let (addr, header_len) = match raw[3] {
                ATYP_IPV4 => {
                    let ip = IpAddr::from([raw[4], raw[5], raw[6], raw[7]]);
                    (SocketAddr::new(ip, u16::from_be_bytes([raw[8], raw[9]])), 10)
                }
                ATYP_IPV6 if n >= 22 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&raw[4..20]);
                    (
                        SocketAddr::new(IpAddr::from(octets), u16::from_be_bytes([raw[20], raw[21]])),
                        22,
                    )
                }
                _ => continue,
            };

            let payload = &raw[header_len..n];
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok((len, addr));
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl OutboundProxy for Socks5Proxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Socks5
    }

    fn server_addr(&self) -> Option<(String, u16)> {
        Some((self.server.clone(), self.port))
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, _ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        debug!(
            "[{}] SOCKS5 {} via {}:{}",
            self.name,
            metadata.remote_address(),
            self.server,
            self.port
        );

        let mut stream = self.connect_server().await?;
        self.negotiate(&mut stream).await?;
        self.request(&mut stream, CMD_CONNECT, metadata).await?;
        Ok(Box::new(stream))
    }

    async fn handshake(&self, mut stream: BoxedStream, metadata: &Metadata) -> Result<BoxedStream> {
        self.negotiate(&mut stream).await?;
        self.request(&mut stream, CMD_CONNECT, metadata).await?;
        Ok(stream)
    }

    async fn listen_packet(
        &self,
        _ctx: &DialContext,
        metadata: &Metadata,
    ) -> Result<BoxedPacketConn> {
        if !self.udp {
            return Err(Error::UdpNotSupported(self.name.clone()));
        }

        let mut control = self.connect_server().await?;
        self.negotiate(&mut control).await?;

        // Associate with an unspecified local endpoint
        let assoc = Metadata {
            host: String::new(),
            dst_ip: Some(IpAddr::from([0, 0, 0, 0])),
            dst_port: 0,
            ..metadata.pure()
        };
        let mut relay = self.request(&mut control, CMD_UDP_ASSOCIATE, &assoc).await?;

        // Servers replying 0.0.0.0 mean "same host as the control connection"
        if relay.ip().is_unspecified() {
            let server_ip = control
                .peer_addr()
                .map(|a| a.ip())
                .map_err(|e| Error::connection(e.to_string()))?;
            relay = SocketAddr::new(server_ip, relay.port());
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Box::new(Socks5Packet {
            socket,
            relay,
            _control: control,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceType;

    #[test]
    fn test_encode_domain_addr() {
        let meta = Metadata::tcp(SourceType::Socks)
            .with_host("example.com")
            .with_dst_port(443);

        let mut buf = Vec::new();
        Socks5Proxy::encode_addr(&mut buf, &meta);

        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1] as usize, "example.com".len());
        assert_eq!(&buf[2..13], b"example.com");
        assert_eq!(&buf[13..], &443u16.to_be_bytes());
    }

    #[test]
    fn test_encode_ipv4_addr() {
        let meta = Metadata::tcp(SourceType::Socks)
            .with_dst_ip("1.2.3.4".parse().unwrap())
            .with_dst_port(53);

        let mut buf = Vec::new();
        Socks5Proxy::encode_addr(&mut buf, &meta);

        assert_eq!(buf, vec![ATYP_IPV4, 1, 2, 3, 4, 0, 53]);
    }
}
