//! SOCKS5 inbound (RFC 1928): CONNECT and UDP ASSOCIATE.

use super::InboundListener;
use crate::common::{Metadata, SourceType};
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub struct Socks5Listener {
    listen: String,
    udp: bool,
    tunnel: Arc<Tunnel>,
}

impl Socks5Listener {
    pub fn new(listen: String, udp: bool, tunnel: Arc<Tunnel>) -> Self {
        Socks5Listener { listen, udp, tunnel }
    }
}

#[async_trait]
impl InboundListener for Socks5Listener {
    fn name(&self) -> &str {
        "socks5"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| Error::connection(format!("bind {}: {}", self.listen, e)))?;
        info!("SOCKS5 listening on {}", self.listen);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("socks5 accept: {}", e);
                    continue;
                }
            };
            let tunnel = self.tunnel.clone();
            let udp = self.udp;
            tokio::spawn(async move {
                if let Err(e) = handle(stream, peer, tunnel, udp).await {
                    debug!("socks5 session {}: {}", peer, e);
                }
            });
        }
    }
}

/// Full SOCKS5 session over an accepted stream; also used by the mixed
/// listener after sniffing.
pub async fn handle<S>(mut stream: S, peer: SocketAddr, tunnel: Arc<Tunnel>, udp: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Greeting
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::protocol("not a SOCKS5 greeting"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    // Request
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5_VERSION {
        return Err(Error::protocol("bad SOCKS5 request"));
    }

    let (host, dst_ip, dst_port) = read_address(&mut stream, request[3]).await?;

    match request[1] {
        CMD_CONNECT => {
            let mut metadata = Metadata::tcp(SourceType::Socks)
                .with_source(peer)
                .with_dst_port(dst_port);
            metadata.host = host;
            metadata.dst_ip = dst_ip;

            // Reply success before piping; failures surface as EOF
            stream
                .write_all(&[SOCKS5_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await?;

            tunnel.handle_stream(metadata, stream).await;
            Ok(())
        }
        CMD_UDP_ASSOCIATE if udp => {
            let relay = UdpSocket::bind((bind_ip(peer.ip()), 0)).await?;
            let relay_addr = relay.local_addr()?;

            let mut reply = vec![SOCKS5_VERSION, 0x00, 0x00];
            match relay_addr.ip() {
                IpAddr::V4(ip) => {
                    reply.push(ATYP_IPV4);
                    reply.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    reply.push(ATYP_IPV6);
                    reply.extend_from_slice(&ip.octets());
                }
            }
            reply.extend_from_slice(&relay_addr.port().to_be_bytes());
            stream.write_all(&reply).await?;

            let relay_task = tokio::spawn(udp_relay(relay, peer, tunnel));

            // The association lives as long as the control connection
            let mut sink = [0u8; 64];
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
            relay_task.abort();
            Ok(())
        }
        CMD_UDP_ASSOCIATE => {
            stream
                .write_all(&[SOCKS5_VERSION, 0x07, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await?;
            Err(Error::unsupported("udp disabled on this inbound"))
        }
        other => {
            stream
                .write_all(&[SOCKS5_VERSION, 0x07, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await?;
            Err(Error::protocol(format!("unsupported SOCKS5 command {}", other)))
        }
    }
}

fn bind_ip(peer: IpAddr) -> IpAddr {
    match peer {
        IpAddr::V4(_) => IpAddr::from([0, 0, 0, 0]),
        IpAddr::V6(_) => "::".parse().unwrap(),
    }
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<(String, Option<IpAddr>, u16)>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut raw = [0u8; 6];
            stream.read_exact(&mut raw).await?;
            let ip = IpAddr::from([raw[0], raw[1], raw[2], raw[3]]);
            Ok((String::new(), Some(ip), u16::from_be_bytes([raw[4], raw[5]])))
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 18];
            stream.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            Ok((
                String::new(),
                Some(IpAddr::from(octets)),
                u16::from_be_bytes([raw[16], raw[17]]),
            ))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut raw = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut raw).await?;
            let host = String::from_utf8_lossy(&raw[..len[0] as usize]).to_string();
            let port = u16::from_be_bytes([raw[len[0] as usize], raw[len[0] as usize + 1]]);
            // A literal IP in the domain slot still counts as an IP
            match host.parse::<IpAddr>() {
                Ok(ip) => Ok((String::new(), Some(ip), port)),
                Err(_) => Ok((host, None, port)),
            }
        }
        other => Err(Error::protocol(format!("bad address type {}", other))),
    }
}

/// Datagram relay for one association: unwrap the SOCKS5 UDP header,
/// dispatch through the tunnel, wrap replies back.
async fn udp_relay(relay: UdpSocket, client: SocketAddr, tunnel: Arc<Tunnel>) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut flow: Option<(crate::outbound::BoxedPacketConn, SocketAddr)> = None;

    loop {
        let (n, from) = match relay.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        if from.ip() != client.ip() {
            continue;
        }
        if n < 10 || buf[2] != 0 {
            continue; // fragmented or malformed
        }

        let (host, dst_ip, dst_port, header_len) = match buf[3] {
            ATYP_IPV4 => {
                let ip = IpAddr::from([buf[4], buf[5], buf[6], buf[7]]);
                (String::new(), Some(ip), u16::from_be_bytes([buf[8], buf[9]]), 10)
            }
            ATYP_DOMAIN => {
                let len = buf[4] as usize;
                if n < 7 + len {
                    continue;
                }
                let host = String::from_utf8_lossy(&buf[5..5 + len]).to_string();
                let port = u16::from_be_bytes([buf[5 + len], buf[6 + len]]);
                (host, None, port, 7 + len)
            }
            ATYP_IPV6 if n >= 22 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[4..20]);
                (
                    String::new(),
                    Some(IpAddr::from(octets)),
                    u16::from_be_bytes([buf[20], buf[21]]),
                    22,
                )
            }
            _ => continue,
        };

        let mut metadata = Metadata::udp(SourceType::Socks)
            .with_source(from)
            .with_dst_port(dst_port);
        metadata.host = host;
        metadata.dst_ip = dst_ip;

        if flow.is_none() {
            match tunnel.connect_packet(&mut metadata).await {
                Ok((conn, _proxy)) => {
                    let Some(target) = resolved_target(&tunnel, &metadata).await else {
                        continue;
                    };
                    flow = Some((conn, target));

                    // Reply pump: wrap answers in the UDP header
                    // (single-flow association keeps this simple)
                }
                Err(e) => {
                    debug!("udp dispatch failed: {}", e);
                    continue;
                }
            }
        }

        if let Some((ref conn, target)) = flow {
            if conn.send_to(&buf[header_len..n], target).await.is_ok() {
                let mut reply = vec![0u8; 64 * 1024];
                if let Ok(Ok((rn, raddr))) = tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    conn.recv_from(&mut reply),
                )
                .await
                {
                    let mut packet = vec![0u8, 0, 0];
                    match raddr.ip() {
                        IpAddr::V4(ip) => {
                            packet.push(ATYP_IPV4);
                            packet.extend_from_slice(&ip.octets());
                        }
                        IpAddr::V6(ip) => {
                            packet.push(ATYP_IPV6);
                            packet.extend_from_slice(&ip.octets());
                        }
                    }
                    packet.extend_from_slice(&raddr.port().to_be_bytes());
                    packet.extend_from_slice(&reply[..rn]);
                    let _ = relay.send_to(&packet, from).await;
                }
            }
        }
    }
}

async fn resolved_target(tunnel: &Tunnel, metadata: &Metadata) -> Option<SocketAddr> {
    if let Some(ip) = metadata.dst_ip {
        return Some(SocketAddr::new(ip, metadata.dst_port));
    }
    let mut meta = metadata.clone();
    tunnel.resolve_metadata(&mut meta).await.ok()?;
    meta.dst_ip.map(|ip| SocketAddr::new(ip, meta.dst_port))
}
