//! DNS-over-HTTPS upstream (RFC 8484).
//!
//! A single HTTP client is shared across queries. Proxy-bound exchanges
//! build a one-shot connection instead, so HTTP/2 stream multiplexing never
//! leaks across proxies.

use super::upstream::{Bootstrap, UpstreamAddr};
use super::{DnsContext, DnsDialer, NameServer, DEFAULT_DNS_TIMEOUT};
use crate::{Error, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const MIME_DNS_MESSAGE: &str = "application/dns-message";
const PROXY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// DoH / DoH3 upstream client
pub struct DohUpstream {
    addr: UpstreamAddr,
    host: String,
    path: String,
    proxy: Option<String>,
    http3: bool,
    dialer: Arc<DnsDialer>,
    client: tokio::sync::OnceCell<reqwest::Client>,
    connector: tokio_rustls::TlsConnector,
}

impl DohUpstream {
    pub fn new(ns: &NameServer, bootstrap: Option<Arc<Bootstrap>>, dialer: Arc<DnsDialer>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        DohUpstream {
            addr: UpstreamAddr::new(ns, bootstrap),
            host: ns.host.clone(),
            path: ns.path.clone(),
            proxy: ns.proxy.clone(),
            http3: ns.kind == super::UpstreamKind::Http3,
            dialer,
            client: tokio::sync::OnceCell::new(),
            connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
        }
    }

    fn url(&self) -> String {
        format!("https://{}{}", self.host, self.path)
    }

    /// Shared transport, built on first use once the server IP is known.
    async fn shared_client(&self) -> Result<&reqwest::Client> {
        let addr = self.addr.socket_addr().await?;
        self.client
            .get_or_try_init(|| async {
                reqwest::Client::builder()
                    .resolve(&self.host, addr)
                    .timeout(DEFAULT_DNS_TIMEOUT)
                    .build()
                    .map_err(|e| Error::dns(format!("doh client: {}", e)))
            })
            .await
    }

    async fn exchange_shared(&self, wire: Vec<u8>) -> Result<Vec<u8>> {
        let client = self.shared_client().await?;
        let response = client
            .post(self.url())
            .header("content-type", MIME_DNS_MESSAGE)
            .header("accept", MIME_DNS_MESSAGE)
            .body(wire)
            .send()
            .await
            .map_err(|e| Error::dns(format!("doh request: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::dns(format!("doh status {}", response.status())));
        }

        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::dns(format!("doh body: {}", e)))?
            .to_vec())
    }

    /// One-shot HTTP/1.1 exchange over a proxy-dialed connection.
    async fn exchange_via_proxy(&self, proxy: &str, wire: Vec<u8>) -> Result<Vec<u8>> {
        let addr = self.addr.socket_addr().await?;
        let stream = self.dialer.connect(addr, Some(proxy)).await?;

        let server_name: rustls::pki_types::ServerName<'static> = self
            .host
            .clone()
            .try_into()
            .map_err(|_| Error::tls(format!("invalid SNI: {}", self.host)))?;
        let mut tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::tls(format!("doh handshake: {}", e)))?;

        let request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: {}\r\nAccept: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.path, self.host, MIME_DNS_MESSAGE, MIME_DNS_MESSAGE, wire.len()
        );
        tls.write_all(request.as_bytes()).await?;
        tls.write_all(&wire).await?;
        tls.flush().await?;

        let mut raw = Vec::with_capacity(4096);
        tls.read_to_end(&mut raw).await?;
        parse_http_response(&raw)
    }
}

/// Minimal HTTP/1.1 response parse: status check, then identity or chunked body.
fn parse_http_response(raw: &[u8]) -> Result<Vec<u8>> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::dns("truncated doh response"))?;

    let headers = String::from_utf8_lossy(&raw[..header_end]);
    let status_line = headers.lines().next().unwrap_or("");
    if !status_line.contains(" 200") {
        return Err(Error::dns(format!("doh status line: {}", status_line)));
    }

    let body = &raw[header_end + 4..];
    let chunked = headers
        .lines()
        .any(|l| l.to_ascii_lowercase().starts_with("transfer-encoding:") && l.contains("chunked"));

    if !chunked {
        return Ok(body.to_vec());
    }

    // Chunked transfer decoding
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let line_end = rest
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| Error::dns("bad chunked framing"))?;
        let size = usize::from_str_radix(
            String::from_utf8_lossy(&rest[..line_end]).trim(),
            16,
        )
        .map_err(|_| Error::dns("bad chunk size"))?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            break;
        }
        if rest.len() < size + 2 {
            return Err(Error::dns("short chunk"));
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
    Ok(out)
}

#[async_trait]
impl super::DnsUpstream for DohUpstream {
    fn address(&self) -> String {
        let scheme = if self.http3 { "h3" } else { "https" };
        format!("{}://{}{}", scheme, self.host, self.path)
    }

    async fn exchange(&self, msg: &Message, ctx: &DnsContext) -> Result<Message> {
        // RFC 8484 §4.1: use DNS ID 0 for cache friendliness
        let mut outgoing = msg.clone();
        outgoing.set_id(0);
        let wire = outgoing.to_vec()?;

        let proxy = ctx.proxy.as_deref().or(self.proxy.as_deref());
        let raw = match proxy {
            Some(proxy) => {
                timeout(
                    PROXY_EXCHANGE_TIMEOUT,
                    self.exchange_via_proxy(proxy, wire),
                )
                .await??
            }
            None => self.exchange_shared(wire).await?,
        };

        let mut answer = Message::from_vec(&raw)?;
        answer.set_id(msg.id());
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(parse_http_response(raw).unwrap(), b"hello");
    }

    #[test]
    fn test_parse_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        assert_eq!(parse_http_response(raw).unwrap(), b"abcde");
    }

    #[test]
    fn test_parse_error_status() {
        let raw = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
        assert!(parse_http_response(raw).is_err());
    }
}
