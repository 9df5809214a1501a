//! HTTP proxy outbound: CONNECT tunneling, optionally over TLS.

use super::{AdapterState, BoxedStream, DialContext, OutboundProxy, ProxyType};
use crate::common::Metadata;
use crate::dns::Resolver;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP CONNECT proxy outbound
pub struct HttpProxy {
    name: String,
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    tls: bool,
    skip_cert_verify: bool,
    resolver: Arc<Resolver>,
    state: AdapterState,
}

impl HttpProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        tls: bool,
        skip_cert_verify: bool,
        resolver: Arc<Resolver>,
    ) -> Self {
        HttpProxy {
            name,
            server,
            port,
            username,
            password,
            tls,
            skip_cert_verify,
            resolver,
            state: AdapterState::default(),
        }
    }

    fn auth_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                let credentials = format!("{}:{}", user, pass);
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                Some(format!("Basic {}", encoded))
            }
            _ => None,
        }
    }

    /// CONNECT handshake over any transport
    async fn http_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let mut request = format!(
            "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\nProxy-Connection: keep-alive\r\n",
            host, port, host, port
        );
        if let Some(auth) = self.auth_header() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::connection(format!("send CONNECT: {}", e)))?;
        stream.flush().await?;

        let mut response = [0u8; 1024];
        let mut total = 0;
        loop {
            let n = stream
                .read(&mut response[total..])
                .await
                .map_err(|e| Error::connection(format!("read CONNECT response: {}", e)))?;
            if n == 0 {
                return Err(Error::connection("connection closed during CONNECT"));
            }
            total += n;

            if let Some(header_end) = find_header_end(&response[..total]) {
                let status_line = String::from_utf8_lossy(&response[..header_end]);
                let status_line = status_line.lines().next().unwrap_or("");

                return if status_line.contains("200") {
                    Ok(())
                } else if status_line.contains("407") {
                    Err(Error::protocol("proxy authentication required"))
                } else {
                    Err(Error::connection(format!("CONNECT failed: {}", status_line)))
                };
            }

            if total >= response.len() {
                return Err(Error::connection("CONNECT response too large"));
            }
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

    fn root_store() -> rustls::RootCertStore {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        roots
    }

    async fn maybe_tls(&self, stream: TcpStream) -> Result<BoxedStream> {
        if !self.tls {
            return Ok(Box::new(stream));
        }

        use rustls::pki_types::ServerName;
        use tokio_rustls::TlsConnector;

        let config = if self.skip_cert_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerify))
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .with_root_certificates(Self::root_store())
                .with_no_client_auth()
        };

        let connector = TlsConnector::from(Arc::new(config));
        let server_name: ServerName<'static> = self
            .server
            .clone()
            .try_into()
            .map_err(|_| Error::tls(format!("invalid server name: {}", self.server)))?;

        let tls_stream = timeout(
            Duration::from_secs(5),
            connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| Error::timeout("TLS handshake"))?
        .map_err(|e| Error::tls(format!("TLS handshake: {}", e)))?;

        Ok(Box::new(tls_stream))
    }

    fn target_of(metadata: &Metadata) -> Result<(String, u16)> {
        let host = if !metadata.host.is_empty() {
            metadata.host.clone()
        } else if let Some(ip) = metadata.dst_ip {
            ip.to_string()
        } else {
            return Err(Error::address("no destination address"));
        };
        Ok((host, metadata.dst_port))
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

#[async_trait]
impl OutboundProxy for HttpProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Http
    }

    fn server_addr(&self) -> Option<(String, u16)> {
        Some((self.server.clone(), self.port))
    }

    fn support_udp(&self) -> bool {
        false
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, _ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        let (host, port) = Self::target_of(metadata)?;
        debug!("[{}] CONNECT {}:{} via {}:{}", self.name, host, port, self.server, self.port);

        let stream = self.connect_server().await?;
        let mut stream = self.maybe_tls(stream).await?;
        self.http_connect(&mut stream, &host, port).await?;
        Ok(stream)
    }

    async fn handshake(&self, mut stream: BoxedStream, metadata: &Metadata) -> Result<BoxedStream> {
        let (host, port) = Self::target_of(metadata)?;
        self.http_connect(&mut stream, &host, port).await?;
        Ok(stream)
    }
}

mod danger {
    //! Certificate verifier for skip-cert-verify

    #[derive(Debug)]
    pub struct NoVerify;

    impl rustls::client::danger::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
        {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                rustls::SignatureScheme::RSA_PSS_SHA256,
                rustls::SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\n"), Some(19));
        assert_eq!(find_header_end(b"incomplete"), None);
    }
}
