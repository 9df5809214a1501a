//! Reject outbound: refuse or silently drop

use super::{AdapterState, BoxedStream, DialContext, OutboundProxy, ProxyType};
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Rejecting adapter. `drop` mode returns a stream that swallows writes and
/// never yields data, so the client sees a stalled connection instead of a
/// reset.
pub struct Reject {
    name: String,
    drop: bool,
    state: AdapterState,
}

impl Reject {
    pub fn new(name: impl Into<String>, drop: bool) -> Self {
        Reject {
            name: name.into(),
            drop,
            state: AdapterState::default(),
        }
    }
}

/// Stream that accepts writes and immediately reports EOF on read
struct BlackHole;

impl AsyncRead for BlackHole {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for BlackHole {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl OutboundProxy for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        if self.drop {
            ProxyType::RejectDrop
        } else {
            ProxyType::Reject
        }
    }

    fn support_udp(&self) -> bool {
        false
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    async fn dial(&self, _ctx: &DialContext, metadata: &Metadata) -> Result<BoxedStream> {
        if self.drop {
            return Ok(Box::new(BlackHole));
        }
        Err(Error::connection(format!(
            "rejected {}",
            metadata.remote_address()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceType;

    #[tokio::test]
    async fn test_reject_refuses() {
        let reject = Reject::new("REJECT", false);
        let meta = Metadata::tcp(SourceType::Http)
            .with_host("blocked.example")
            .with_dst_port(443);
        assert!(reject.dial(&DialContext::default(), &meta).await.is_err());
    }

    #[tokio::test]
    async fn test_reject_drop_black_holes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let reject = Reject::new("REJECT-DROP", true);
        let meta = Metadata::tcp(SourceType::Http)
            .with_host("blocked.example")
            .with_dst_port(443);

        let mut stream = reject.dial(&DialContext::default(), &meta).await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
