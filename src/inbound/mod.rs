//! Inbound listeners feeding the dispatcher.

mod forward;
mod http;
mod mixed;
mod socks5;

pub use forward::TunnelListener;
pub use http::{handle as http_handle, HttpListener};
pub use mixed::MixedListener;
pub use socks5::{handle as socks5_handle, Socks5Listener};

use crate::Result;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bound listener; `start` runs until the task is dropped.
#[async_trait]
pub trait InboundListener: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;
}

/// Stream with already-consumed bytes replayed first, used by the mixed
/// listener after protocol sniffing.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        PrefixedStream {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Listen address for a configured port: loopback unless LAN is allowed.
pub fn listen_addr(port: u16, allow_lan: bool) -> String {
    if allow_lan {
        format!("0.0.0.0:{}", port)
    } else {
        format!("127.0.0.1:{}", port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefixed_stream_replays() {
        let (near, mut far) = duplex(64);
        far.write_all(b"tail").await.unwrap();

        let mut stream = PrefixedStream::new(b"head-".to_vec(), near);
        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"head-tail");
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr(7890, false), "127.0.0.1:7890");
        assert_eq!(listen_addr(7890, true), "0.0.0.0:7890");
    }
}
