//! DHCP-derived DNS upstream.
//!
//! Resolves the interface's DNS servers with a DHCPINFORM probe, caches
//! them for an hour or until the interface address changes, and collapses
//! concurrent refreshes into one probe.

use super::upstream::{batch_exchange, UdpUpstream};
use super::{DnsContext, DnsDialer, DnsUpstream, NameServer, UpstreamKind};
use crate::common::SingleFlight;
use crate::{Error, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

const IFACE_TTL: Duration = Duration::from_secs(20);
const DHCP_TTL: Duration = Duration::from_secs(3600);
const DHCP_TIMEOUT: Duration = Duration::from_secs(60);

const DHCP_MAGIC: [u8; 4] = [99, 130, 83, 99];
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_PARAM_REQUEST: u8 = 55;
const OPT_DNS_SERVERS: u8 = 6;
const OPT_END: u8 = 255;
const DHCP_INFORM: u8 = 8;

struct DhcpState {
    iface_checked: Option<Instant>,
    dns_expires: Option<Instant>,
    local_addr: Option<Ipv4Addr>,
    clients: Vec<Arc<dyn DnsUpstream>>,
}

/// DHCP DNS upstream bound to one interface.
pub struct DhcpUpstream {
    iface: String,
    dialer: Arc<DnsDialer>,
    state: Mutex<DhcpState>,
    inflight: SingleFlight<Vec<IpAddr>>,
}

impl DhcpUpstream {
    pub fn new(iface: impl Into<String>, dialer: Arc<DnsDialer>) -> Self {
        DhcpUpstream {
            iface: iface.into(),
            dialer,
            state: Mutex::new(DhcpState {
                iface_checked: None,
                dns_expires: None,
                local_addr: None,
                clients: Vec::new(),
            }),
            inflight: SingleFlight::new(),
        }
    }

    /// Best-effort local IPv4 of the default route, used to notice
    /// interface address changes between probes.
    fn current_local_addr() -> Option<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("198.51.100.1:53").ok()?;
        match socket.local_addr().ok()? {
            SocketAddr::V4(addr) => Some(*addr.ip()),
            SocketAddr::V6(_) => None,
        }
    }

    /// Whether the cached servers are still valid.
    fn cache_valid(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(checked) = state.iface_checked {
            if now < checked + IFACE_TTL {
                return !state.clients.is_empty()
                    && state.dns_expires.map(|e| now < e).unwrap_or(false);
            }
        }
        state.iface_checked = Some(now);

        let current = Self::current_local_addr();
        let addr_changed = current != state.local_addr;
        state.local_addr = current;

        !addr_changed
            && !state.clients.is_empty()
            && state.dns_expires.map(|e| now < e).unwrap_or(false)
    }

    async fn resolve_clients(&self) -> Result<Vec<Arc<dyn DnsUpstream>>> {
        if self.cache_valid() {
            return Ok(self.state.lock().clients.clone());
        }

        let iface = self.iface.clone();
        let local = self.state.lock().local_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let servers = self
            .inflight
            .execute(&format!("dhcp:{}", self.iface), async move {
                timeout(DHCP_TIMEOUT, probe_dns_servers(&iface, local)).await?
            })
            .await?;

        let clients: Vec<Arc<dyn DnsUpstream>> = servers
            .iter()
            .map(|ip| {
                let ns = NameServer {
                    kind: UpstreamKind::Udp,
                    host: ip.to_string(),
                    port: 53,
                    path: String::new(),
                    proxy: None,
                    interface: Some(self.iface.clone()),
                };
                Arc::new(UdpUpstream::new(&ns, None, self.dialer.clone(), true))
                    as Arc<dyn DnsUpstream>
            })
            .collect();

        {
            let mut state = self.state.lock();
            state.clients = clients.clone();
            state.dns_expires = Some(Instant::now() + DHCP_TTL);
        }

        debug!("dhcp({}) resolved {} dns servers", self.iface, servers.len());
        Ok(clients)
    }
}

#[async_trait]
impl DnsUpstream for DhcpUpstream {
    fn address(&self) -> String {
        format!("dhcp://{}", self.iface)
    }

    fn allow_ech(&self) -> bool {
        false
    }

    async fn exchange(&self, msg: &Message, ctx: &DnsContext) -> Result<Message> {
        if super::upstream::has_ech_query(msg) {
            return Err(Error::unsupported("ECH lookup over DHCP upstream"));
        }

        let clients = self.resolve_clients().await?;
        batch_exchange(&clients, msg, ctx).await
    }
}

/// Broadcast a DHCPINFORM and collect option 6 from the acknowledgement.
async fn probe_dns_servers(iface: &str, local: Ipv4Addr) -> Result<Vec<IpAddr>> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if !iface.is_empty() {
        socket.bind_device(Some(iface.as_bytes()))?;
    }
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], 68)).into())?;

    let socket = UdpSocket::from_std(socket.into())?;

    let xid: u32 = rand::random();
    let request = build_inform(xid, local);
    socket
        .send_to(&request, SocketAddr::from(([255, 255, 255, 255], 67)))
        .await?;

    let mut buf = [0u8; 1500];
    loop {
        let (n, _) = socket.recv_from(&mut buf).await?;
        if let Some(servers) = parse_ack_dns(&buf[..n], xid) {
            if servers.is_empty() {
                return Err(Error::dns(format!("dhcp({}): no dns offered", iface)));
            }
            return Ok(servers);
        }
    }
}

fn build_inform(xid: u32, ciaddr: Ipv4Addr) -> Vec<u8> {
    let mut pkt = vec![0u8; 240];
    pkt[0] = 1; // BOOTREQUEST
    pkt[1] = 1; // Ethernet
    pkt[2] = 6; // hlen
    pkt[4..8].copy_from_slice(&xid.to_be_bytes());
    pkt[12..16].copy_from_slice(&ciaddr.octets());
    // Locally administered placeholder MAC
    let mac: [u8; 6] = [0x02, rand::random(), rand::random(), rand::random(), rand::random(), rand::random()];
    pkt[28..34].copy_from_slice(&mac);
    pkt[236..240].copy_from_slice(&DHCP_MAGIC);

    pkt.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, DHCP_INFORM]);
    pkt.extend_from_slice(&[OPT_PARAM_REQUEST, 1, OPT_DNS_SERVERS]);
    pkt.push(OPT_END);
    pkt
}

fn parse_ack_dns(pkt: &[u8], xid: u32) -> Option<Vec<IpAddr>> {
    if pkt.len() < 240 || pkt[0] != 2 {
        return None;
    }
    if pkt[4..8] != xid.to_be_bytes() {
        return None;
    }
    if pkt[236..240] != DHCP_MAGIC {
        return None;
    }

    let mut servers = Vec::new();
    let mut i = 240;
    while i < pkt.len() {
        let code = pkt[i];
        if code == OPT_END {
            break;
        }
        if code == 0 {
            i += 1;
            continue;
        }
        if i + 1 >= pkt.len() {
            break;
        }
        let len = pkt[i + 1] as usize;
        let end = i + 2 + len;
        if end > pkt.len() {
            break;
        }
        if code == OPT_DNS_SERVERS {
            for chunk in pkt[i + 2..end].chunks_exact(4) {
                servers.push(IpAddr::from([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        i = end;
    }
    Some(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inform_layout() {
        let pkt = build_inform(0xdeadbeef, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(pkt[0], 1);
        assert_eq!(&pkt[4..8], &0xdeadbeefu32.to_be_bytes());
        assert_eq!(&pkt[12..16], &[192, 168, 1, 10]);
        assert_eq!(&pkt[236..240], &DHCP_MAGIC);
        assert_eq!(pkt[240..243], [OPT_MESSAGE_TYPE, 1, DHCP_INFORM]);
    }

    #[test]
    fn test_parse_ack() {
        let mut pkt = vec![0u8; 240];
        pkt[0] = 2; // BOOTREPLY
        pkt[4..8].copy_from_slice(&7u32.to_be_bytes());
        pkt[236..240].copy_from_slice(&DHCP_MAGIC);
        pkt.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, 5]); // DHCPACK
        pkt.extend_from_slice(&[OPT_DNS_SERVERS, 8, 8, 8, 8, 8, 1, 1, 1, 1]);
        pkt.push(OPT_END);

        let servers = parse_ack_dns(&pkt, 7).unwrap();
        assert_eq!(
            servers,
            vec![
                "8.8.8.8".parse::<IpAddr>().unwrap(),
                "1.1.1.1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_parse_ack_rejects_wrong_xid() {
        let mut pkt = vec![0u8; 240];
        pkt[0] = 2;
        pkt[4..8].copy_from_slice(&7u32.to_be_bytes());
        pkt[236..240].copy_from_slice(&DHCP_MAGIC);
        assert!(parse_ack_dns(&pkt, 8).is_none());
    }
}
