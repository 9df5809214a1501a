//! Latency probing: a small HEAD request issued through an adapter.

use super::{BoxedStream, DialContext, OutboundProxy, DELAY_INFINITE};
use crate::common::{Metadata, SourceType};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct ProbeTarget {
    tls: bool,
    host: String,
    port: u16,
    path: String,
}

fn parse_url(url: &str) -> Result<ProbeTarget> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::address(format!("invalid test url: {}", url)))?;

    let tls = match scheme {
        "http" => false,
        "https" => true,
        other => return Err(Error::address(format!("unsupported scheme: {}", other))),
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.parse::<u16>().is_ok() => (h.to_string(), p.parse().unwrap()),
        _ => (authority.to_string(), if tls { 443 } else { 80 }),
    };

    if host.is_empty() {
        return Err(Error::address(format!("invalid test url: {}", url)));
    }

    Ok(ProbeTarget { tls, host, port, path })
}

async fn tls_wrap(stream: BoxedStream, host: &str) -> Result<BoxedStream> {
    use rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name: ServerName<'static> = host
        .to_string()
        .try_into()
        .map_err(|_| Error::tls(format!("invalid server name: {}", host)))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tls(format!("probe TLS handshake: {}", e)))?;
    Ok(Box::new(tls_stream))
}

/// Issue a HEAD request for `url` through `proxy` and return the elapsed
/// round trip in milliseconds.
pub async fn probe_url<P: OutboundProxy + ?Sized>(proxy: &P, url: &str) -> Result<u16> {
    let target = parse_url(url)?;
    let metadata = Metadata::tcp(SourceType::Inner)
        .with_host(target.host.clone())
        .with_dst_port(target.port);

    let start = Instant::now();

    let result = timeout(PROBE_TIMEOUT, async {
        let stream = proxy.dial(&DialContext::default(), &metadata).await?;
        let mut stream = if target.tls {
            tls_wrap(stream, &target.host).await?
        } else {
            stream
        };

        let request = format!(
            "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            target.path, target.host
        );
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::connection("empty probe response"));
        }
        if !buf.starts_with(b"HTTP/") {
            return Err(Error::protocol("malformed probe response"));
        }
        Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => {
            let elapsed = start.elapsed().as_millis();
            Ok(elapsed.min((DELAY_INFINITE - 1) as u128) as u16)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::timeout(format!("probe {}", url))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        let t = parse_url("http://www.gstatic.com/generate_204").unwrap();
        assert!(!t.tls);
        assert_eq!(t.host, "www.gstatic.com");
        assert_eq!(t.port, 80);
        assert_eq!(t.path, "/generate_204");

        let t = parse_url("https://example.com:8443").unwrap();
        assert!(t.tls);
        assert_eq!(t.port, 8443);
        assert_eq!(t.path, "/");

        assert!(parse_url("ftp://bad").is_err());
        assert!(parse_url("no-scheme").is_err());
    }
}
