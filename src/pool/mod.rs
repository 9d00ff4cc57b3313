//! Upstream client pooling.
//!
//! A [`ClientPool`] produces [`Client`] handles for one request at a time.
//! `put` returns a handle when the request is over; a non-`None` error tells
//! the pool the connection state is unknown and must be discarded.

pub use self::binary::BinaryPool;
pub use self::reuse::ReusePool;

mod binary;
mod reuse;

use std::any::Any;
use std::fmt;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::ServerPacket;
use crate::wire::{Block, Credentials, Exception, ProfileInfo, Progress, Query, QueryMeta};

/// One upstream connection, scoped to a single query at a time.
#[async_trait]
pub trait Client: Send {
    async fn next_packet(&mut self) -> Result<ServerPacket>;

    async fn send_query(&mut self, q: &Query) -> Result<QueryMeta>;
    async fn cancel_query(&mut self) -> Result<()>;

    async fn send_block(&mut self, b: &Block, compressed: bool) -> Result<()>;
    async fn recv_block(&mut self, compressed: bool) -> Result<Block>;

    async fn recv_exception(&mut self) -> Result<Exception>;
    async fn recv_progress(&mut self) -> Result<Progress>;
    async fn recv_profile_info(&mut self) -> Result<ProfileInfo>;

    /// Credentials this client authenticated with; pools key idle sets on it.
    fn credentials(&self) -> &Credentials;

    /// Escape hatch for wrapping pools that need their concrete shim back.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

#[async_trait]
pub trait ClientPool: Send + Sync {
    async fn get(&self, opts: &[ClientOption]) -> Result<Box<dyn Client>>;

    /// Return a client. `err` carries the request outcome so the pool can
    /// discard connections whose protocol state is unknown.
    async fn put(&self, client: Box<dyn Client>, err: Option<&Error>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Per-request options applied at `get` time. Pools apply the variants they
/// understand and warn about the rest rather than dropping them silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOption {
    Credentials(Credentials),
    Database(String),
    AgentName(String),
}

impl fmt::Display for ClientOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientOption::Credentials(_) => write!(f, "credentials"),
            ClientOption::Database(db) => write!(f, "database={db}"),
            ClientOption::AgentName(name) => write!(f, "agent_name={name}"),
        }
    }
}

/// Fold the credential-bearing options over a base. Options that carry no
/// credential information are reported, not silently dropped.
pub fn apply_credentials(mut creds: Credentials, opts: &[ClientOption]) -> Credentials {
    for opt in opts {
        match opt {
            ClientOption::Credentials(c) => creds = c.clone(),
            ClientOption::Database(db) => creds.database = db.clone(),
            other => log::warn!("unused client option: {other}"),
        }
    }
    creds
}
