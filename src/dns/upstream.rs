//! Plain UDP/TCP and DoT upstream clients, bootstrap resolution, and the
//! first-success exchange race.

use super::{DnsContext, DnsDialer, NameServer, DEFAULT_DNS_TIMEOUT};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// A single upstream DNS transport.
#[async_trait]
pub trait DnsUpstream: Send + Sync {
    /// Display address for logs
    fn address(&self) -> String;

    /// ECH (HTTPS-type) lookups are refused on bootstrap-unsafe clients
    fn allow_ech(&self) -> bool {
        true
    }

    async fn exchange(&self, msg: &Message, ctx: &DnsContext) -> Result<Message>;
}

/// Race `msg` across all `clients`; the first successful answer wins and the
/// rest are cancelled by drop.
pub async fn batch_exchange(
    clients: &[Arc<dyn DnsUpstream>],
    msg: &Message,
    ctx: &DnsContext,
) -> Result<Message> {
    if clients.is_empty() {
        return Err(Error::dns("no upstreams configured"));
    }

    let mut futures: FuturesUnordered<_> = clients
        .iter()
        .map(|client| {
            let client = client.clone();
            let msg = msg.clone();
            let ctx = ctx.clone();
            async move { client.exchange(&msg, &ctx).await }
        })
        .collect();

    let mut last_err = None;
    while let Some(result) = futures.next().await {
        match result {
            Ok(answer) => return Ok(answer),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::dns("exchange failed")))
}

/// First A/AAAA addresses found in a response
pub fn answer_ips(msg: &Message) -> Vec<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Build a recursive query for `host`/`qtype`.
pub fn build_query(host: &str, qtype: RecordType) -> Result<Message> {
    let name = Name::from_str(&format!("{}.", host.trim_end_matches('.')))
        .map_err(|e| Error::dns(format!("bad query name {}: {}", host, e)))?;

    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_op_code(OpCode::Query)
        .set_message_type(MessageType::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, qtype));
    Ok(msg)
}

/// Resolves hostnames of other upstreams through the plain-IP default pool.
/// This client is "unsafe" in the ECH sense: type-65 queries are refused.
pub struct Bootstrap {
    clients: Vec<Arc<dyn DnsUpstream>>,
}

impl Bootstrap {
    pub fn new(clients: Vec<Arc<dyn DnsUpstream>>) -> Self {
        Bootstrap { clients }
    }

    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse() {
            return Ok(ip);
        }
        if self.clients.is_empty() {
            return Err(Error::dns(format!(
                "no default-nameserver to bootstrap {}",
                host
            )));
        }

        let query = build_query(host, RecordType::A)?;
        let answer = batch_exchange(&self.clients, &query, &DnsContext::default()).await?;
        answer_ips(&answer)
            .into_iter()
            .next()
            .ok_or_else(|| Error::DnsNotFound(host.to_string()))
    }
}

/// Upstream endpoint whose hostname is bootstrap-resolved once.
pub struct UpstreamAddr {
    host: String,
    port: u16,
    bootstrap: Option<Arc<Bootstrap>>,
    resolved: Mutex<Option<IpAddr>>,
}

impl UpstreamAddr {
    pub fn new(ns: &NameServer, bootstrap: Option<Arc<Bootstrap>>) -> Self {
        UpstreamAddr {
            host: ns.host.clone(),
            port: ns.port,
            bootstrap,
            resolved: Mutex::new(ns.host.parse().ok()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn socket_addr(&self) -> Result<SocketAddr> {
        if let Some(ip) = *self.resolved.lock() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let bootstrap = self
            .bootstrap
            .as_ref()
            .ok_or_else(|| Error::dns(format!("cannot bootstrap {}", self.host)))?;
        let ip = bootstrap.resolve(&self.host).await?;
        *self.resolved.lock() = Some(ip);
        Ok(SocketAddr::new(ip, self.port))
    }
}

fn effective_proxy<'a>(own: &'a Option<String>, ctx: &'a DnsContext) -> Option<&'a str> {
    ctx.proxy.as_deref().or(own.as_deref())
}

/// Exchange over an established stream with 2-byte length framing (RFC 1035 §4.2.2)
pub(crate) async fn exchange_framed<S>(stream: &mut S, msg: &Message) -> Result<Message>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + ?Sized,
{
    let wire = msg.to_vec()?;
    let mut framed = Vec::with_capacity(wire.len() + 2);
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(&wire);
    stream.write_all(&framed).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    Ok(Message::from_vec(&buf)?)
}

/// Plain UDP upstream; truncated answers retry over TCP, and proxy-bound
/// exchanges run DNS-over-TCP through the proxy.
pub struct UdpUpstream {
    addr: UpstreamAddr,
    proxy: Option<String>,
    dialer: Arc<DnsDialer>,
    /// Bootstrap-unsafe clients (the default pool) refuse ECH lookups
    ech: bool,
}

impl UdpUpstream {
    pub fn new(
        ns: &NameServer,
        bootstrap: Option<Arc<Bootstrap>>,
        dialer: Arc<DnsDialer>,
        ech: bool,
    ) -> Self {
        UdpUpstream {
            addr: UpstreamAddr::new(ns, bootstrap),
            proxy: ns.proxy.clone(),
            dialer,
            ech,
        }
    }

    async fn exchange_udp(&self, addr: SocketAddr, msg: &Message) -> Result<Message> {
        let bind: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        socket.send(&msg.to_vec()?).await?;

        let mut buf = [0u8; 4096];
        loop {
            let n = socket.recv(&mut buf).await?;
            let answer = Message::from_vec(&buf[..n])?;
            if answer.id() == msg.id() {
                return Ok(answer);
            }
        }
    }
}

#[async_trait]
impl DnsUpstream for UdpUpstream {
    fn address(&self) -> String {
        format!("udp://{}", self.addr.host())
    }

    fn allow_ech(&self) -> bool {
        self.ech
    }

    async fn exchange(&self, msg: &Message, ctx: &DnsContext) -> Result<Message> {
        if !self.allow_ech() && has_ech_query(msg) {
            return Err(Error::unsupported("ECH lookup on bootstrap client"));
        }

        let addr = self.addr.socket_addr().await?;
        let proxy = effective_proxy(&self.proxy, ctx);

        let fut = async {
            if let Some(proxy) = proxy {
                let mut stream = self.dialer.connect(addr, Some(proxy)).await?;
                return exchange_framed(&mut *stream, msg).await;
            }

            let answer = self.exchange_udp(addr, msg).await?;
            if answer.truncated() {
                debug!("truncated answer from {}, retrying over tcp", addr);
                let mut stream = self.dialer.connect(addr, None).await?;
                return exchange_framed(&mut *stream, msg).await;
            }
            Ok(answer)
        };

        timeout(DEFAULT_DNS_TIMEOUT, fut).await?
    }
}

/// DNS-over-TCP upstream
pub struct TcpUpstream {
    addr: UpstreamAddr,
    proxy: Option<String>,
    dialer: Arc<DnsDialer>,
}

impl TcpUpstream {
    pub fn new(ns: &NameServer, bootstrap: Option<Arc<Bootstrap>>, dialer: Arc<DnsDialer>) -> Self {
        TcpUpstream {
            addr: UpstreamAddr::new(ns, bootstrap),
            proxy: ns.proxy.clone(),
            dialer,
        }
    }
}

#[async_trait]
impl DnsUpstream for TcpUpstream {
    fn address(&self) -> String {
        format!("tcp://{}", self.addr.host())
    }

    async fn exchange(&self, msg: &Message, ctx: &DnsContext) -> Result<Message> {
        let addr = self.addr.socket_addr().await?;
        let proxy = effective_proxy(&self.proxy, ctx);

        let fut = async {
            let mut stream = self.dialer.connect(addr, proxy).await?;
            exchange_framed(&mut *stream, msg).await
        };
        timeout(DEFAULT_DNS_TIMEOUT, fut).await?
    }
}

/// DNS-over-TLS upstream (RFC 7858)
pub struct DotUpstream {
    addr: UpstreamAddr,
    proxy: Option<String>,
    dialer: Arc<DnsDialer>,
    connector: tokio_rustls::TlsConnector,
}

impl DotUpstream {
    pub fn new(ns: &NameServer, bootstrap: Option<Arc<Bootstrap>>, dialer: Arc<DnsDialer>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        DotUpstream {
            addr: UpstreamAddr::new(ns, bootstrap),
            proxy: ns.proxy.clone(),
            dialer,
            connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
        }
    }
}

#[async_trait]
impl DnsUpstream for DotUpstream {
    fn address(&self) -> String {
        format!("tls://{}", self.addr.host())
    }

    async fn exchange(&self, msg: &Message, ctx: &DnsContext) -> Result<Message> {
        let addr = self.addr.socket_addr().await?;
        let proxy = effective_proxy(&self.proxy, ctx);

        let server_name: rustls::pki_types::ServerName<'static> = self
            .addr
            .host()
            .to_string()
            .try_into()
            .map_err(|_| Error::tls(format!("invalid SNI: {}", self.addr.host())))?;

        let fut = async {
            let stream = self.dialer.connect(addr, proxy).await?;
            let mut tls = self
                .connector
                .connect(server_name, stream)
                .await
                .map_err(|e| Error::tls(format!("DoT handshake: {}", e)))?;
            exchange_framed(&mut tls, msg).await
        };
        timeout(DEFAULT_DNS_TIMEOUT, fut).await?
    }
}

pub(crate) fn has_ech_query(msg: &Message) -> bool {
    msg.queries()
        .iter()
        .any(|q| q.query_type() == RecordType::HTTPS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;

    struct Fixed(IpAddr);

    #[async_trait]
    impl DnsUpstream for Fixed {
        fn address(&self) -> String {
            "fixed".to_string()
        }

        async fn exchange(&self, msg: &Message, _ctx: &DnsContext) -> Result<Message> {
            let mut answer = Message::new();
            answer.set_id(msg.id());
            if let Some(query) = msg.queries().first() {
                let IpAddr::V4(v4) = self.0 else {
                    return Err(Error::dns("v4 only"));
                };
                answer.add_answer(Record::from_rdata(
                    query.name().clone(),
                    300,
                    RData::A(A(v4)),
                ));
            }
            Ok(answer)
        }
    }

    struct Failing;

    #[async_trait]
    impl DnsUpstream for Failing {
        fn address(&self) -> String {
            "failing".to_string()
        }

        async fn exchange(&self, _msg: &Message, _ctx: &DnsContext) -> Result<Message> {
            Err(Error::dns("unreachable"))
        }
    }

    #[tokio::test]
    async fn test_batch_exchange_first_success_wins() {
        let clients: Vec<Arc<dyn DnsUpstream>> = vec![
            Arc::new(Failing),
            Arc::new(Fixed("1.2.3.4".parse().unwrap())),
        ];
        let query = build_query("example.com", RecordType::A).unwrap();
        let answer = batch_exchange(&clients, &query, &DnsContext::default())
            .await
            .unwrap();
        assert_eq!(answer_ips(&answer), vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_batch_exchange_all_failed() {
        let clients: Vec<Arc<dyn DnsUpstream>> = vec![Arc::new(Failing), Arc::new(Failing)];
        let query = build_query("example.com", RecordType::A).unwrap();
        assert!(batch_exchange(&clients, &query, &DnsContext::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_resolves_via_pool() {
        let bootstrap = Bootstrap::new(vec![Arc::new(Fixed("9.9.9.9".parse().unwrap()))]);
        let ip = bootstrap.resolve("dns.google").await.unwrap();
        assert_eq!(ip, "9.9.9.9".parse::<IpAddr>().unwrap());
        // Plain IPs short-circuit
        let ip = bootstrap.resolve("1.1.1.1").await.unwrap();
        assert_eq!(ip, "1.1.1.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_build_query_shape() {
        let query = build_query("example.com", RecordType::AAAA).unwrap();
        assert_eq!(query.queries().len(), 1);
        assert!(query.recursion_desired());
        assert_eq!(query.queries()[0].query_type(), RecordType::AAAA);
    }

    #[test]
    fn test_ech_query_detection() {
        let https = build_query("example.com", RecordType::HTTPS).unwrap();
        assert!(has_ech_query(&https));
        let a = build_query("example.com", RecordType::A).unwrap();
        assert!(!has_ech_query(&a));
    }
}
