//! Mixed port: SOCKS5 and HTTP on one listener, sniffed per connection.

use super::{http, socks5, InboundListener, PrefixedStream};
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct MixedListener {
    listen: String,
    udp: bool,
    tunnel: Arc<Tunnel>,
}

impl MixedListener {
    pub fn new(listen: String, udp: bool, tunnel: Arc<Tunnel>) -> Self {
        MixedListener { listen, udp, tunnel }
    }

    async fn dispatch(mut stream: TcpStream, tunnel: Arc<Tunnel>, udp: bool) -> Result<()> {
        let peer = stream.peer_addr()?;

        // First byte decides: 0x05 is a SOCKS5 greeting, anything else is
        // treated as HTTP
        let mut first = [0u8; 1];
        let n = stream.read(&mut first).await?;
        if n == 0 {
            return Ok(());
        }

        let stream = PrefixedStream::new(first.to_vec(), stream);
        if first[0] == 0x05 {
            socks5::handle(stream, peer, tunnel, udp).await
        } else {
            http::handle(stream, peer, tunnel).await
        }
    }
}

#[async_trait]
impl InboundListener for MixedListener {
    fn name(&self) -> &str {
        "mixed"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| Error::connection(format!("bind {}: {}", self.listen, e)))?;
        info!("Mixed proxy listening on {}", self.listen);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("mixed accept: {}", e);
                    continue;
                }
            };
            let tunnel = self.tunnel.clone();
            let udp = self.udp;
            tokio::spawn(async move {
                if let Err(e) = Self::dispatch(stream, tunnel, udp).await {
                    debug!("mixed session {}: {}", peer, e);
                }
            });
        }
    }
}
