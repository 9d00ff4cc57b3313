//! On-wire data model: queries, blocks, columns and server-side reports.
//!
//! Column payloads stay in their ClickHouse binary encoding end to end; the
//! proxy never materializes values, it only needs per-type element sizes to
//! copy bytes correctly.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Protocol version triple. The revision gates feature checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ver {
    pub major: u64,
    pub minor: u64,
    pub revision: u64,
}

impl fmt::Display for Ver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// A protocol participant: a name plus its version triple.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Agent {
    pub name: String,
    pub ver: Ver,
}

/// Credentials captured at the client Hello and forwarded upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Defaults a ClickHouse server assumes when a client sends nothing.
pub fn default_credentials() -> Credentials {
    Credentials {
        database: "default".into(),
        user: "default".into(),
        password: String::new(),
    }
}

static INSERT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)\s*INSERT\s+INTO").expect("insert regex"));

/// One query as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub sql: String,
    pub id: String,
    pub quota_key: String,
    /// Per-query LZ4 toggle for block payloads.
    pub compressed: bool,
    pub client: Agent,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Query {
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn is_insert(&self) -> bool {
        INSERT_RE.is_match(&self.sql)
    }
}

/// One column of a block: a textual type name and the raw on-wire payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: String,
    pub raw: Vec<u8>,
}

/// The column schema a server declares for a query, a zero-row block.
pub type QueryMeta = Vec<Column>;

/// A contiguous run of rows over an ordered set of columns.
///
/// The empty block (no columns, zero rows) is the protocol sentinel that
/// terminates an insert's data stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub table: String,
    pub rows: u64,
    pub cols: Vec<Column>,
}

impl Block {
    pub fn is_empty(&self) -> bool {
        self.rows == 0 && self.cols.is_empty()
    }

    /// On-wire size of the block body, used for batch thresholds.
    pub fn data_size(&self) -> u64 {
        self.cols
            .iter()
            .map(|c| 1 + c.name.len() as u64 + 1 + c.ty.len() as u64 + c.raw.len() as u64)
            .sum()
    }
}

/// A server-originated error, possibly a chain of causes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{name} ({code:#x}): {message}")]
pub struct Exception {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
    pub cause: Option<Box<Exception>>,
}

impl Exception {
    /// Wrap any proxy error for the wire. Server exceptions pass through
    /// unchanged, everything else becomes code -1.
    pub fn from_error(err: &crate::error::Error) -> Exception {
        match err {
            crate::error::Error::Server(e) => e.clone(),
            other => Exception {
                code: -1,
                name: "error".into(),
                message: other.to_string(),
                stack_trace: String::new(),
                cause: None,
            },
        }
    }
}

/// Execution progress counters, forwarded upstream to downstream verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
}

/// Final query profile, forwarded verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: u64,
    pub rows_before_limit: u64,
    pub calc_rows_before_limit: u64,
}
