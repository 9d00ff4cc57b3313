use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::binary::compress::{compress_frame, MAX_BLOCK_SIZE};
use crate::binary::uvarint::{put_uvarint, MAX_VARINT_LEN64};
use crate::error::Result;

/// Byte-level writer for the native protocol.
///
/// While the compressed sub-stream is enabled, writes accumulate in a
/// pending buffer that is emitted as one LZ4 frame when the sub-stream is
/// disabled (or when it outgrows [`MAX_BLOCK_SIZE`]). Frame boundaries
/// therefore never land mid-message.
pub(crate) struct Encoder<W> {
    w: W,
    zbuf: Vec<u8>,
    compressed: bool,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(w: W) -> Self {
        Encoder {
            w,
            zbuf: Vec::new(),
            compressed: false,
        }
    }

    pub async fn set_compressed(&mut self, on: bool) -> Result<()> {
        if self.compressed && !on {
            self.flush_frame().await?;
        }
        self.compressed = on;
        Ok(())
    }

    async fn flush_frame(&mut self) -> Result<()> {
        if self.zbuf.is_empty() {
            return Ok(());
        }

        let frame = compress_frame(&self.zbuf);
        self.zbuf.clear();
        self.w.write_all(&frame).await?;
        Ok(())
    }

    /// Flush buffered bytes down to the socket. Callers only flush at
    /// message boundaries, outside any compressed section.
    pub async fn flush(&mut self) -> Result<()> {
        self.flush_frame().await?;
        self.w.flush().await?;
        Ok(())
    }

    pub async fn write_all(&mut self, p: &[u8]) -> Result<()> {
        if self.compressed {
            self.zbuf.extend_from_slice(p);
            if self.zbuf.len() >= MAX_BLOCK_SIZE {
                self.flush_frame().await?;
            }
            return Ok(());
        }

        self.w.write_all(p).await?;
        Ok(())
    }

    pub async fn uvarint(&mut self, x: u64) -> Result<()> {
        let mut buf = [0u8; MAX_VARINT_LEN64];
        let n = put_uvarint(&mut buf, x);
        self.write_all(&buf[..n]).await
    }

    pub async fn uint64(&mut self, x: u64) -> Result<()> {
        self.write_all(&x.to_le_bytes()).await
    }

    pub async fn uint32(&mut self, x: u32) -> Result<()> {
        self.write_all(&x.to_le_bytes()).await
    }

    pub async fn uint16(&mut self, x: u16) -> Result<()> {
        self.write_all(&x.to_le_bytes()).await
    }

    pub async fn uint8(&mut self, x: u8) -> Result<()> {
        self.write_all(&[x]).await
    }

    pub async fn int64(&mut self, x: i64) -> Result<()> {
        self.write_all(&x.to_le_bytes()).await
    }

    pub async fn int32(&mut self, x: i32) -> Result<()> {
        self.write_all(&x.to_le_bytes()).await
    }

    pub async fn int16(&mut self, x: i16) -> Result<()> {
        self.write_all(&x.to_le_bytes()).await
    }

    pub async fn int8(&mut self, x: i8) -> Result<()> {
        self.write_all(&x.to_le_bytes()).await
    }

    pub async fn bool(&mut self, x: bool) -> Result<()> {
        self.write_all(&[x as u8]).await
    }

    pub async fn string(&mut self, s: &str) -> Result<()> {
        self.uvarint(s.len() as u64).await?;
        self.write_all(s.as_bytes()).await
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.w
    }
}
