//! Reverse proxy for the ClickHouse native TCP protocol.
//!
//! Clients connect here instead of ClickHouse; the proxy terminates each
//! session, relays queries upstream and transparently coalesces high-rate
//! row inserts into large batches before shipping them on.

pub mod batcher;
pub mod conn;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod wire;

mod binary;

pub use crate::{
    batcher::{BatcherConfig, BatcherPool},
    error::{Error, Result},
    pool::{BinaryPool, Client, ClientOption, ClientPool, ReusePool},
    proxy::Proxy,
    wire::{Block, Credentials, Query},
};
