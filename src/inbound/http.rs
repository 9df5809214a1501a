//! HTTP proxy inbound: CONNECT tunneling plus plain absolute-form requests.

use super::InboundListener;
use crate::common::{Metadata, SourceType};
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const MAX_HEADER: usize = 16 * 1024;

pub struct HttpListener {
    listen: String,
    tunnel: Arc<Tunnel>,
}

impl HttpListener {
    pub fn new(listen: String, tunnel: Arc<Tunnel>) -> Self {
        HttpListener { listen, tunnel }
    }
}

#[async_trait]
impl InboundListener for HttpListener {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| Error::connection(format!("bind {}: {}", self.listen, e)))?;
        info!("HTTP proxy listening on {}", self.listen);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("http accept: {}", e);
                    continue;
                }
            };
            let tunnel = self.tunnel.clone();
            tokio::spawn(async move {
                if let Err(e) = handle(stream, peer, tunnel).await {
                    debug!("http session {}: {}", peer, e);
                }
            });
        }
    }
}

/// One HTTP proxy exchange on an accepted stream; also used by the mixed
/// listener after sniffing.
pub async fn handle<S>(mut stream: S, peer: SocketAddr, tunnel: Arc<Tunnel>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let head = read_head(&mut stream).await?;
    let (header, body_start) = split_head(&head)?;
    let text = String::from_utf8_lossy(header);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(&target, 443)?;
        let mut metadata = Metadata::tcp(SourceType::Http)
            .with_source(peer)
            .with_host(host)
            .with_dst_port(port);
        if let Ok(ip) = metadata.host.parse() {
            metadata.dst_ip = Some(ip);
            metadata.host.clear();
        }

        match tunnel.connect(&mut metadata).await {
            Ok(handle) => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await?;
                let _ = crate::tunnel::relay(stream, handle.stream).await;
                Ok(())
            }
            Err(e) => {
                let _ = stream
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                    .await;
                Err(e)
            }
        }
    } else {
        // Absolute-form request: http://host[:port]/path
        let rest = target
            .strip_prefix("http://")
            .ok_or_else(|| Error::protocol(format!("unsupported request target: {}", target)))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = split_host_port(authority, 80)?;

        let mut metadata = Metadata::tcp(SourceType::Http)
            .with_source(peer)
            .with_host(host.clone())
            .with_dst_port(port);

        let handle = match tunnel.connect(&mut metadata).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = stream
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                    .await;
                return Err(e);
            }
        };
        let mut outbound = handle.stream;

        // Rewrite to origin-form and strip hop-by-hop headers
        let version = parts.next().unwrap_or("HTTP/1.1");
        let mut rewritten = format!("{} {} {}\r\n", method, path, version);
        for line in lines {
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("proxy-connection:") || lower.starts_with("proxy-authorization:") {
                continue;
            }
            rewritten.push_str(line);
            rewritten.push_str("\r\n");
        }
        rewritten.push_str("\r\n");

        outbound.write_all(rewritten.as_bytes()).await?;
        if body_start < head.len() {
            outbound.write_all(&head[body_start..]).await?;
        }

        let _ = crate::tunnel::relay(stream, outbound).await;
        Ok(())
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::connection("client closed before request"));
        }
        head.push(byte[0]);
        if head.len() > MAX_HEADER {
            return Err(Error::protocol("request header too large"));
        }
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
    }
}

fn split_head(head: &[u8]) -> Result<(&[u8], usize)> {
    head.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (&head[..i], i + 4))
        .ok_or_else(|| Error::protocol("incomplete request head"))
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    // Bracketed IPv6 literals keep their colons
    if let Some(rest) = authority.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(Error::address(format!("bad authority: {}", authority)));
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| Error::address(format!("bad port in {}", authority)))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => {
            Ok((
                host.to_string(),
                port.parse()
                    .map_err(|_| Error::address(format!("bad port in {}", authority)))?,
            ))
        }
        _ => Ok((authority.to_string(), default_port)),
    }
}
