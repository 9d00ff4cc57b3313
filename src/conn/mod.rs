//! Framed connection core shared by both sides of the proxy.
//!
//! [`ServerConn`] speaks the protocol as if we were ClickHouse, to a
//! downstream client. [`ClientConn`] speaks it as a client, to an upstream
//! server. Both delegate the symmetric parts (blocks, exceptions, progress,
//! agent info) to [`Conn`].

pub use self::client::ClientConn;
pub use self::counted::{ConnStats, CountedStream, StatsSnapshot};
pub use self::server::{AuthFn, ServerConn};

mod client;
mod counted;
mod server;

use tokio::io::{self, AsyncRead, AsyncWrite, BufReader, BufWriter, ReadHalf, WriteHalf};

use crate::binary::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::wire::{Agent, Block, Column, Exception, ProfileInfo, Progress};

const MAX_EXCEPTION_DEPTH: usize = 64;

pub(crate) struct Conn<S> {
    pub(crate) dec: Decoder<BufReader<ReadHalf<S>>>,
    pub(crate) enc: Encoder<BufWriter<WriteHalf<S>>>,
}

impl<S: AsyncRead + AsyncWrite + Send> Conn<S> {
    pub(crate) fn new(stream: S) -> Self {
        let (r, w) = io::split(stream);
        Conn {
            dec: Decoder::new(BufReader::new(r)),
            enc: Encoder::new(BufWriter::new(w)),
        }
    }

    pub(crate) async fn recv_packet(&mut self) -> Result<u64> {
        self.dec.uvarint().await
    }

    pub(crate) async fn send_packet(&mut self, tp: u64) -> Result<()> {
        self.enc.uvarint(tp).await
    }

    pub(crate) async fn recv_agent(&mut self) -> Result<Agent> {
        let name = self.dec.string().await?;
        let major = self.dec.uvarint().await?;
        let minor = self.dec.uvarint().await?;
        let revision = self.dec.uvarint().await?;

        Ok(Agent {
            name,
            ver: crate::wire::Ver {
                major,
                minor,
                revision,
            },
        })
    }

    pub(crate) async fn send_agent(&mut self, a: &Agent) -> Result<()> {
        self.enc.string(&a.name).await?;
        self.enc.uvarint(a.ver.major).await?;
        self.enc.uvarint(a.ver.minor).await?;
        self.enc.uvarint(a.ver.revision).await
    }

    async fn recv_block_info(&mut self) -> Result<()> {
        let tag = self.dec.uvarint().await?;
        if tag != 1 {
            return Err(Error::BlockInfoTag(tag));
        }
        let _is_overflows = self.dec.uvarint().await?;

        let tag = self.dec.uvarint().await?;
        if tag != 2 {
            return Err(Error::BlockInfoTag(tag));
        }
        let _bucket_num = self.dec.int32().await?;

        let tag = self.dec.uvarint().await?;
        if tag != 0 {
            return Err(Error::BlockInfoTag(tag));
        }

        Ok(())
    }

    async fn send_block_info(&mut self) -> Result<()> {
        self.enc.uvarint(1).await?;
        self.enc.uvarint(0).await?;
        self.enc.uvarint(2).await?;
        self.enc.int32(-1).await?;
        self.enc.uvarint(0).await
    }

    pub(crate) async fn recv_block_header(&mut self) -> Result<(u64, u64)> {
        self.recv_block_info().await?;
        let cols = self.dec.uvarint().await?;
        let rows = self.dec.uvarint().await?;
        Ok((cols, rows))
    }

    pub(crate) async fn send_block_header(&mut self, cols: u64, rows: u64) -> Result<()> {
        self.send_block_info().await?;
        self.enc.uvarint(cols).await?;
        self.enc.uvarint(rows).await
    }

    pub(crate) async fn recv_block(&mut self, compressed: bool) -> Result<Block> {
        let table = self.dec.string().await?;

        if compressed {
            self.dec.set_compressed(true);
        }
        let res = self.recv_block_body(table).await;
        self.dec.set_compressed(false);
        res
    }

    async fn recv_block_body(&mut self, table: String) -> Result<Block> {
        let (cols, rows) = self.recv_block_header().await?;

        let mut block = Block {
            table,
            rows,
            cols: Vec::with_capacity(cols as usize),
        };

        for _ in 0..cols {
            let name = self.dec.string().await?;
            let ty = self.dec.string().await?;

            let mut raw = Vec::new();
            match ty.as_str() {
                "String" => {
                    for _ in 0..rows {
                        self.dec.read_str_raw(&mut raw).await?;
                    }
                }
                "UInt64" | "Int64" => self.dec.read_append(8 * rows as usize, &mut raw).await?,
                t if t.starts_with("DateTime64(") => {
                    self.dec.read_append(8 * rows as usize, &mut raw).await?
                }
                "UInt32" | "Int32" => self.dec.read_append(4 * rows as usize, &mut raw).await?,
                "UInt16" | "Int16" | "Date" => {
                    self.dec.read_append(2 * rows as usize, &mut raw).await?
                }
                "UInt8" | "Int8" => self.dec.read_append(rows as usize, &mut raw).await?,
                _ => return Err(Error::UnsupportedColumnType { name, ty }),
            }

            block.cols.push(Column { name, ty, raw });
        }

        Ok(block)
    }

    pub(crate) async fn send_block(&mut self, pk: u64, b: &Block, compressed: bool) -> Result<()> {
        self.send_packet(pk).await?;
        self.enc.string(&b.table).await?;

        if compressed {
            self.enc.set_compressed(true).await?;
        }

        self.send_block_header(b.cols.len() as u64, b.rows).await?;

        for col in &b.cols {
            self.enc.string(&col.name).await?;
            self.enc.string(&col.ty).await?;
            self.enc.write_all(&col.raw).await?;
        }

        self.enc.set_compressed(false).await
    }

    pub(crate) async fn send_empty_block(&mut self, pk: u64, compressed: bool) -> Result<()> {
        self.send_packet(pk).await?;
        self.enc.string("").await?;

        if compressed {
            self.enc.set_compressed(true).await?;
        }
        self.send_block_header(0, 0).await?;
        self.enc.set_compressed(false).await
    }

    pub(crate) async fn recv_exception(&mut self) -> Result<Exception> {
        let mut items = Vec::new();

        loop {
            let code = self.dec.int32().await?;
            let name = self.dec.string().await?;
            let message = self.dec.string().await?;
            let stack_trace = self.dec.string().await?;
            let more = self.dec.bool().await?;

            items.push(Exception {
                code,
                name,
                message,
                stack_trace,
                cause: None,
            });

            if !more {
                break;
            }
            if items.len() >= MAX_EXCEPTION_DEPTH {
                return Err(Error::ExceptionDepth);
            }
        }

        let mut exc = None;
        for mut item in items.into_iter().rev() {
            item.cause = exc.map(Box::new);
            exc = Some(item);
        }
        Ok(exc.expect("at least one exception decoded"))
    }

    pub(crate) async fn send_exception_chain(&mut self, exc: &Exception) -> Result<()> {
        let mut next = Some(exc);

        while let Some(e) = next {
            self.enc.int32(e.code).await?;
            self.enc.string(&e.name).await?;
            self.enc.string(&e.message).await?;
            self.enc.string(&e.stack_trace).await?;
            self.enc.bool(e.cause.is_some()).await?;

            next = e.cause.as_deref();
        }

        Ok(())
    }

    pub(crate) async fn recv_progress(&mut self) -> Result<Progress> {
        Ok(Progress {
            rows: self.dec.uvarint().await?,
            bytes: self.dec.uvarint().await?,
            total_rows: self.dec.uvarint().await?,
        })
    }

    pub(crate) async fn send_progress_body(&mut self, p: &Progress) -> Result<()> {
        self.enc.uvarint(p.rows).await?;
        self.enc.uvarint(p.bytes).await?;
        self.enc.uvarint(p.total_rows).await
    }

    pub(crate) async fn recv_profile_info(&mut self) -> Result<ProfileInfo> {
        Ok(ProfileInfo {
            rows: self.dec.uvarint().await?,
            blocks: self.dec.uvarint().await?,
            bytes: self.dec.uvarint().await?,
            applied_limit: self.dec.uvarint().await?,
            rows_before_limit: self.dec.uvarint().await?,
            calc_rows_before_limit: self.dec.uvarint().await?,
        })
    }

    pub(crate) async fn send_profile_info_body(&mut self, p: &ProfileInfo) -> Result<()> {
        self.enc.uvarint(p.rows).await?;
        self.enc.uvarint(p.blocks).await?;
        self.enc.uvarint(p.bytes).await?;
        self.enc.uvarint(p.applied_limit).await?;
        self.enc.uvarint(p.rows_before_limit).await?;
        self.enc.uvarint(p.calc_rows_before_limit).await
    }
}
