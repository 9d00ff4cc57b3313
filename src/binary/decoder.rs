use tokio::io::{AsyncRead, AsyncReadExt};

use crate::binary::compress::{decompress_frame, CHECKSUM_LEN, HEADER_LEN, MAX_FRAME_SIZE};
use crate::binary::uvarint::{put_uvarint, MAX_VARINT_LEN64};
use crate::error::{Error, Result};

/// Byte-level reader for the native protocol.
///
/// While the compressed sub-stream is enabled, reads are served from the
/// decompressed frame buffer, refilled one frame at a time. Senders align
/// frames with message boundaries, so the buffer drains exactly when the
/// sub-stream is disabled.
pub(crate) struct Decoder<R> {
    r: R,
    zbuf: Vec<u8>,
    zpos: usize,
    compressed: bool,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(r: R) -> Self {
        Decoder {
            r,
            zbuf: Vec::new(),
            zpos: 0,
            compressed: false,
        }
    }

    pub fn set_compressed(&mut self, on: bool) {
        self.compressed = on;
    }

    async fn fill_frame(&mut self) -> Result<()> {
        let mut checksum = [0u8; CHECKSUM_LEN];
        self.r.read_exact(&mut checksum).await?;

        let mut head = [0u8; HEADER_LEN];
        self.r.read_exact(&mut head).await?;

        let compressed_size = u32::from_le_bytes(head[1..5].try_into().unwrap()) as usize;
        if !(HEADER_LEN..=MAX_FRAME_SIZE).contains(&compressed_size) {
            return Err(Error::Decompress(format!(
                "compressed size out of range: {compressed_size}"
            )));
        }

        let mut body = vec![0u8; compressed_size];
        body[..HEADER_LEN].copy_from_slice(&head);
        self.r.read_exact(&mut body[HEADER_LEN..]).await?;

        self.zbuf = decompress_frame(checksum, &body)?;
        self.zpos = 0;
        Ok(())
    }

    pub async fn read_exact_buf(&mut self, out: &mut [u8]) -> Result<()> {
        if !self.compressed {
            self.r.read_exact(out).await?;
            return Ok(());
        }

        let mut n = 0;
        while n < out.len() {
            if self.zpos == self.zbuf.len() {
                self.fill_frame().await?;
            }
            let take = (out.len() - n).min(self.zbuf.len() - self.zpos);
            out[n..n + take].copy_from_slice(&self.zbuf[self.zpos..self.zpos + take]);
            self.zpos += take;
            n += take;
        }
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact_buf(&mut b).await?;
        Ok(b[0])
    }

    pub async fn uvarint(&mut self) -> Result<u64> {
        let mut x = 0u64;
        let mut s = 0u32;
        for i in 0..MAX_VARINT_LEN64 {
            let b = self.read_byte().await?;
            if b < 0x80 {
                if i == MAX_VARINT_LEN64 - 1 && b > 1 {
                    return Err(Error::VarintOverflow);
                }
                return Ok(x | (b as u64) << s);
            }
            x |= ((b & 0x7f) as u64) << s;
            s += 7;
        }
        Err(Error::VarintOverflow)
    }

    pub async fn uint64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact_buf(&mut b).await?;
        Ok(u64::from_le_bytes(b))
    }

    pub async fn uint32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact_buf(&mut b).await?;
        Ok(u32::from_le_bytes(b))
    }

    pub async fn uint16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact_buf(&mut b).await?;
        Ok(u16::from_le_bytes(b))
    }

    pub async fn uint8(&mut self) -> Result<u8> {
        self.read_byte().await
    }

    pub async fn int64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_exact_buf(&mut b).await?;
        Ok(i64::from_le_bytes(b))
    }

    pub async fn int32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact_buf(&mut b).await?;
        Ok(i32::from_le_bytes(b))
    }

    pub async fn int16(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.read_exact_buf(&mut b).await?;
        Ok(i16::from_le_bytes(b))
    }

    pub async fn int8(&mut self) -> Result<i8> {
        Ok(self.read_byte().await? as i8)
    }

    pub async fn bool(&mut self) -> Result<bool> {
        Ok(self.read_byte().await? != 0)
    }

    pub async fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.uvarint().await? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact_buf(&mut buf).await?;
        Ok(buf)
    }

    pub async fn string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.bytes().await?)?)
    }

    /// Read one length-prefixed string, appending its on-wire bytes
    /// (prefix included) to `out`. Used for `String` column payloads,
    /// which are forwarded without re-encoding.
    pub async fn read_str_raw(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let len = self.uvarint().await?;

        let mut pre = [0u8; MAX_VARINT_LEN64];
        let n = put_uvarint(&mut pre, len);
        out.extend_from_slice(&pre[..n]);

        let start = out.len();
        out.resize(start + len as usize, 0);
        self.read_exact_buf(&mut out[start..]).await
    }

    /// Read exactly `n` bytes, appending them to `out`.
    pub async fn read_append(&mut self, n: usize, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.resize(start + n, 0);
        self.read_exact_buf(&mut out[start..]).await
    }
}
