//! Byte shuttling: tracked outbound streams and the bidirectional pump.

use crate::outbound::BoxedStream;
use crate::statistic::{StatisticManager, TrackedConnection};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Per-direction copy buffer size
pub const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Outbound stream wrapper that feeds per-connection and per-proxy traffic
/// counters, and unregisters the connection on drop.
pub struct TrackedStream {
    inner: BoxedStream,
    proxy: String,
    statistic: Arc<StatisticManager>,
    tracked: Arc<TrackedConnection>,
}

impl TrackedStream {
    pub fn new(
        inner: BoxedStream,
        proxy: String,
        statistic: Arc<StatisticManager>,
        tracked: Arc<TrackedConnection>,
    ) -> Self {
        TrackedStream {
            inner,
            proxy,
            statistic,
            tracked,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.tracked.id
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.statistic.close(&self.tracked.id);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes = (buf.filled().len() - before) as u64;
            if bytes > 0 {
                this.statistic.add_download(&this.proxy, bytes);
                this.tracked.add_download(bytes);
            }
        }
        result
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.statistic.add_upload(&this.proxy, *n as u64);
                this.tracked.add_upload(*n as u64);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Pump bytes both ways until either side closes or errors, then shut both
/// down. Per-direction ordering is preserved; the directions are
/// independent.
pub async fn relay<A, B>(mut client: A, mut server: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::io::copy_bidirectional_with_sizes(
        &mut client,
        &mut server,
        RELAY_BUFFER_SIZE,
        RELAY_BUFFER_SIZE,
    )
    .await;

    let _ = client.shutdown().await;
    let _ = server.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistic::ConnectionRecord;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_tracked_stream_counts() {
        let statistic = Arc::new(StatisticManager::new());
        let tracked = statistic.track(TrackedConnection::new(
            "c1".to_string(),
            ConnectionRecord::default(),
            vec!["DIRECT".to_string()],
            "MATCH".to_string(),
            String::new(),
        ));

        let (near, mut far) = duplex(1024);
        let mut stream = TrackedStream::new(
            Box::new(near),
            "DIRECT".to_string(),
            statistic.clone(),
            tracked.clone(),
        );

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();

        far.write_all(b"worlds!").await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(tracked.upload(), 5);
        assert_eq!(tracked.download(), 7);
        assert_eq!(statistic.proxy_total("DIRECT"), (5, 7));

        // Drop unregisters the connection
        assert_eq!(statistic.connection_count(), 1);
        drop(stream);
        assert_eq!(statistic.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (a1, a2) = duplex(1024);
        let (b1, b2) = duplex(1024);

        let pump = tokio::spawn(async move { relay(a2, b1).await });

        let (mut client, mut server) = (a1, b2);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        drop(server);
        let (up, down) = pump.await.unwrap().unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }
}
