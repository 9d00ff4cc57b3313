use thiserror::Error;

use crate::wire::Exception;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the codec, the connection state machines, the pools
/// and the batcher. Protocol and codec errors are fatal for the session that
/// produced them; a [`Error::Server`] ends the request but not the session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected packet: {0:#x}")]
    UnexpectedPacket(u64),

    #[error("block info tag: {0:#x}")]
    BlockInfoTag(u64),

    #[error("unsupported column type: {ty} (column {name})")]
    UnsupportedColumnType { name: String, ty: String },

    #[error("external tables are not supported")]
    ExtTablesUnsupported,

    #[error("unsupported query setting: {0}")]
    UnsupportedSetting(String),

    #[error("query state: {0:#x}")]
    BadQueryState(u64),

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("string is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("unknown compression method: {0:#x}")]
    BadCompressionMethod(u8),

    #[error("compressed frame checksum mismatch")]
    ChecksumMismatch,

    #[error("compressed frame: {0}")]
    Decompress(String),

    #[error("query meta carries rows: {0}")]
    MetaHasRows(u64),

    #[error("exception chain too deep")]
    ExceptionDepth,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Server(#[from] Exception),

    #[error("column mismatch: expected {expected}, got {got}")]
    ColumnMismatch { expected: String, got: String },

    #[error("batch buffer is over its limit: {pending} + {incoming} > {limit} bytes")]
    BatchOverloaded {
        pending: u64,
        incoming: u64,
        limit: u64,
    },

    #[error("no query in flight on this client")]
    NoActiveQuery,

    #[error("pool is closed")]
    PoolClosed,
}

impl Error {
    /// A read that hit EOF at a packet boundary is a clean close, not a
    /// protocol violation.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
