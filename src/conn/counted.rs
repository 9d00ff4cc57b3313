use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::wire::Block;

/// Shared per-connection counters, reported with every request log line.
#[derive(Debug, Default)]
pub struct ConnStats {
    pub read_bytes: AtomicU64,
    pub written_bytes: AtomicU64,
    pub blocks: AtomicU64,
    pub rows: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub blocks: u64,
    pub rows: u64,
}

impl ConnStats {
    pub fn add_block(&self, b: &Block) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(b.rows, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Per-request delta against an earlier snapshot.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            read_bytes: self.read_bytes - earlier.read_bytes,
            written_bytes: self.written_bytes - earlier.written_bytes,
            blocks: self.blocks - earlier.blocks,
            rows: self.rows - earlier.rows,
        }
    }
}

/// Byte-counting wrapper around the session socket.
#[pin_project]
pub struct CountedStream<S> {
    #[pin]
    inner: S,
    stats: Arc<ConnStats>,
}

impl<S> CountedStream<S> {
    pub fn new(inner: S, stats: Arc<ConnStats>) -> Self {
        CountedStream { inner, stats }
    }
}

impl<S: AsyncRead> AsyncRead for CountedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            this.stats.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for CountedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();

        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            this.stats
                .written_bytes
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
