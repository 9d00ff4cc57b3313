//! Insert-coalescing client pool.
//!
//! Wraps an inner [`ClientPool`] and intercepts INSERT queries: the client
//! gets its column meta and EndOfStream straight away while the data blocks
//! accumulate per (database, query text) and are flushed upstream as one
//! large insert when a row/byte/time threshold trips.

use std::any::Any;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::pool::{apply_credentials, Client, ClientOption, ClientPool};
use crate::protocol::ServerPacket;
use crate::wire::{
    default_credentials, Block, Column, Credentials, Exception, ProfileInfo, Progress, Query,
    QueryMeta,
};

/// Accounts for the block header when sizing a flush against `max_bytes`.
const BLOCK_HEADER_OVERHEAD: u64 = 40;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_rows: u64,
    pub max_bytes: u64,
    pub max_interval: Duration,
    /// Background committer wake-up period.
    pub tick_interval: Duration,
    /// Absolute cap on bytes held for one batch; inserts beyond it are
    /// refused with an error the proxy surfaces as a server exception.
    pub max_pending_bytes: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        BatcherConfig {
            max_rows: 1_000_000,
            max_bytes: 100 << 20,
            max_interval: Duration::from_secs(60),
            tick_interval: Duration::from_secs(5),
            max_pending_bytes: 1 << 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    database: String,
    sql: String,
}

struct Batch {
    query: Query,
    opts: Vec<ClientOption>,

    /// Upstream-declared column schema; `None` forces a (re-)priming flush.
    meta: Option<QueryMeta>,
    block: Block,

    last_commit: Instant,
    total_rows: u64,
}

impl Batch {
    fn new(query: Query, opts: Vec<ClientOption>) -> Self {
        Batch {
            query,
            opts,
            meta: None,
            block: Block::default(),
            last_commit: Instant::now(),
            total_rows: 0,
        }
    }
}

#[derive(Default)]
struct State {
    batches: HashMap<BatchKey, Batch>,
    committer: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    cancel: CancellationToken,
}

/// A [`ClientPool`] that coalesces inserts. Cheap to clone; clones share
/// the batch map and the committer.
#[derive(Clone)]
pub struct BatcherPool {
    inner: Arc<dyn ClientPool>,
    cfg: Arc<BatcherConfig>,
    shared: Arc<Shared>,
}

impl BatcherPool {
    pub fn new(inner: Arc<dyn ClientPool>, cfg: BatcherConfig) -> Self {
        BatcherPool {
            inner,
            cfg: Arc::new(cfg),
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Find or create the batch for `key` and hand back its column meta.
    async fn batch(&self, key: &BatchKey, q: &Query, opts: &[ClientOption]) -> Result<QueryMeta> {
        let mut st = self.shared.state.lock().await;

        let batch = self.get_or_create(&mut st, key, q, opts).await?;
        if batch.meta.is_none() {
            // a failed flush left the schema unknown, re-prime
            self.commit_batch(key, batch).await?;
        }

        Ok(batch.meta.clone().expect("meta cached by commit"))
    }

    async fn get_or_create<'a>(
        &self,
        st: &'a mut State,
        key: &BatchKey,
        q: &Query,
        opts: &[ClientOption],
    ) -> Result<&'a mut Batch> {
        if !st.batches.contains_key(key) {
            self.ensure_committer(st);

            debug!("new batch: db={} query={}", key.database, key.sql);
            let mut batch = Batch::new(q.clone(), opts.to_vec());
            // priming flush: learn the column schema before accepting data
            self.commit_batch(key, &mut batch).await?;
            st.batches.insert(key.clone(), batch);
        }

        Ok(st.batches.get_mut(key).expect("just inserted"))
    }

    /// Merge client-submitted blocks into the batch, flushing ahead of any
    /// block that would push it over the row or byte threshold.
    async fn add_blocks(
        &self,
        key: &BatchKey,
        q: &Query,
        opts: &[ClientOption],
        blocks: Vec<Block>,
    ) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        let batch = self.get_or_create(&mut st, key, q, opts).await?;

        for next in blocks {
            validate_columns(&batch.block, &next)?;

            let pending = batch.block.data_size();
            let incoming = next.data_size();
            if pending.saturating_add(incoming) > self.cfg.max_pending_bytes {
                return Err(Error::BatchOverloaded {
                    pending,
                    incoming,
                    limit: self.cfg.max_pending_bytes,
                });
            }

            if self.need_commit(batch, Some(&next), false) {
                self.commit_batch(key, batch).await?;
            }

            for (dst, src) in batch.block.cols.iter_mut().zip(next.cols.iter()) {
                dst.raw.extend_from_slice(&src.raw);
            }
            batch.block.rows += next.rows;
        }

        if self.need_commit(batch, None, false) {
            self.commit_batch(key, batch).await?;
        }

        Ok(())
    }

    fn need_commit(&self, b: &Batch, next: Option<&Block>, fin: bool) -> bool {
        if b.meta.is_none() {
            return true;
        }
        if fin && b.block.rows > 0 {
            return true;
        }
        if Instant::now().duration_since(b.last_commit) > self.cfg.max_interval {
            return true;
        }

        if let Some(next) = next {
            if b.block.rows + next.rows > self.cfg.max_rows {
                return true;
            }
            let bytes = BLOCK_HEADER_OVERHEAD
                .saturating_add(b.block.data_size())
                .saturating_add(next.data_size());
            if bytes > self.cfg.max_bytes {
                return true;
            }
        }

        false
    }

    /// Ship the accumulated block upstream (or just re-learn the schema when
    /// empty). On failure the schema is dropped so the next attempt
    /// re-primes; accumulated rows stay put for a later retry.
    async fn commit_batch(&self, key: &BatchKey, b: &mut Batch) -> Result<()> {
        let rows = b.block.rows;
        debug!("commit batch: db={} rows={}", key.database, rows);

        let mut client = self.inner.get(&b.opts).await?;
        let res = run_commit(client.as_mut(), b).await;

        match res {
            Ok(meta) => {
                if let Err(err) = self.inner.put(client, None).await {
                    warn!("return upstream after flush: {err}");
                }

                reset_block(&mut b.block, &meta);
                b.meta = Some(meta);
                b.last_commit = Instant::now();
                b.total_rows += rows;
                Ok(())
            }
            Err(err) => {
                let _ = self.inner.put(client, Some(&err)).await;
                b.meta = None;
                Err(err)
            }
        }
    }

    fn ensure_committer(&self, st: &mut State) {
        if st.committer.is_some() {
            return;
        }

        let pool = self.clone();
        let cancel = self.shared.cancel.clone();

        st.committer = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.cfg.tick_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => pool.commit_or_delete().await,
                }
            }

            pool.commit_all().await;
            debug!("batch committer stopped");
        }));
    }

    async fn commit_or_delete(&self) {
        let mut st = self.shared.state.lock().await;
        let now = Instant::now();

        let keys: Vec<BatchKey> = st.batches.keys().cloned().collect();
        for key in keys {
            let batch = &st.batches[&key];
            if batch.block.rows == 0
                && now.duration_since(batch.last_commit) > self.cfg.max_interval
            {
                info!(
                    "evict idle batch: db={} total_rows={}",
                    key.database, batch.total_rows
                );
                st.batches.remove(&key);
                continue;
            }

            let batch = st.batches.get_mut(&key).expect("key still present");
            if self.need_commit(batch, None, false) {
                if let Err(err) = self.commit_batch(&key, batch).await {
                    warn!("batch flush failed: db={} err={err}", key.database);
                }
            }
        }
    }

    async fn commit_all(&self) {
        let mut st = self.shared.state.lock().await;

        let keys: Vec<BatchKey> = st.batches.keys().cloned().collect();
        for key in keys {
            let batch = st.batches.get_mut(&key).expect("key still present");
            if self.need_commit(batch, None, true) {
                if let Err(err) = self.commit_batch(&key, batch).await {
                    warn!("final batch flush failed: db={} err={err}", key.database);
                }
            }
        }

        st.batches.clear();
    }
}

async fn run_commit(client: &mut dyn Client, b: &Batch) -> Result<QueryMeta> {
    let meta = client.send_query(&b.query).await?;

    if b.block.rows == 0 {
        client.cancel_query().await?;
    } else {
        client.send_block(&b.block, b.query.compressed).await?;
        client
            .send_block(&Block::default(), b.query.compressed)
            .await?;
    }

    match client.next_packet().await? {
        ServerPacket::EndOfStream => Ok(meta),
        p => Err(Error::UnexpectedPacket(p.code())),
    }
}

fn validate_columns(have: &Block, incoming: &Block) -> Result<()> {
    if have.cols.len() != incoming.cols.len() {
        return Err(Error::ColumnMismatch {
            expected: format!("{} columns", have.cols.len()),
            got: format!("{} columns", incoming.cols.len()),
        });
    }

    for (a, b) in have.cols.iter().zip(incoming.cols.iter()) {
        if a.name != b.name || a.ty != b.ty {
            return Err(Error::ColumnMismatch {
                expected: format!("{} {}", a.name, a.ty),
                got: format!("{} {}", b.name, b.ty),
            });
        }
    }

    Ok(())
}

/// Clear the accumulated rows, re-materializing column descriptors from the
/// freshly declared meta. Backing storage is kept when the column count
/// still matches.
fn reset_block(block: &mut Block, meta: &QueryMeta) {
    if block.cols.len() == meta.len() {
        for (col, m) in block.cols.iter_mut().zip(meta.iter()) {
            col.name.clone_from(&m.name);
            col.ty.clone_from(&m.ty);
            col.raw.clear();
        }
    } else {
        block.cols = meta
            .iter()
            .map(|m| Column {
                name: m.name.clone(),
                ty: m.ty.clone(),
                raw: Vec::new(),
            })
            .collect();
    }
    block.rows = 0;
}

#[async_trait]
impl ClientPool for BatcherPool {
    async fn get(&self, opts: &[ClientOption]) -> Result<Box<dyn Client>> {
        Ok(Box::new(BatchClient {
            pool: self.clone(),
            upstream: None,
            key: None,
            query: None,
            pending: Vec::new(),
            creds: apply_credentials(default_credentials(), opts),
            opts: opts.to_vec(),
        }))
    }

    async fn put(&self, client: Box<dyn Client>, err: Option<&Error>) -> Result<()> {
        match client.into_any().downcast::<BatchClient>() {
            Ok(shim) => {
                if let Some(upstream) = shim.upstream {
                    return self.inner.put(upstream, err).await;
                }
                Ok(())
            }
            // not one of ours, nothing to recycle
            Err(_) => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        self.shared.cancel.cancel();

        let committer = self.shared.state.lock().await.committer.take();
        match committer {
            // the committer flushes everything on its way out
            Some(handle) => {
                if let Err(err) = handle.await {
                    warn!("committer task: {err}");
                }
            }
            None => self.commit_all().await,
        }

        self.inner.close().await
    }
}

/// What `BatcherPool::get` hands out. Transparent for non-INSERT traffic,
/// a local accumulator for inserts.
struct BatchClient {
    pool: BatcherPool,

    /// Set in transparent mode; everything delegates to it.
    upstream: Option<Box<dyn Client>>,

    /// Set in insert mode.
    key: Option<BatchKey>,
    query: Option<Query>,
    pending: Vec<Block>,

    creds: Credentials,
    opts: Vec<ClientOption>,
}

#[async_trait]
impl Client for BatchClient {
    /// In insert mode the commit is acknowledged as soon as the blocks are
    /// queued locally; the flush happens later.
    async fn next_packet(&mut self) -> Result<ServerPacket> {
        match &mut self.upstream {
            Some(up) => up.next_packet().await,
            None => Ok(ServerPacket::EndOfStream),
        }
    }

    async fn send_query(&mut self, q: &Query) -> Result<QueryMeta> {
        if !q.is_insert() {
            let mut client = self.pool.inner.get(&self.opts).await?;
            let meta = client.send_query(q).await;
            self.upstream = Some(client);
            return meta;
        }

        let key = BatchKey {
            database: self.creds.database.clone(),
            sql: q.sql.clone(),
        };

        let meta = self.pool.batch(&key, q, &self.opts).await?;
        self.key = Some(key);
        self.query = Some(q.clone());
        Ok(meta)
    }

    async fn cancel_query(&mut self) -> Result<()> {
        match &mut self.upstream {
            Some(up) => up.cancel_query().await,
            None => {
                self.pending.clear();
                Ok(())
            }
        }
    }

    async fn send_block(&mut self, b: &Block, compressed: bool) -> Result<()> {
        if let Some(up) = &mut self.upstream {
            return up.send_block(b, compressed).await;
        }

        if !b.is_empty() {
            self.pending.push(b.clone());
            return Ok(());
        }

        let key = self.key.as_ref().ok_or(Error::NoActiveQuery)?;
        let query = self.query.as_ref().ok_or(Error::NoActiveQuery)?;
        let blocks = mem::take(&mut self.pending);

        self.pool.add_blocks(key, query, &self.opts, blocks).await
    }

    async fn recv_block(&mut self, compressed: bool) -> Result<Block> {
        match &mut self.upstream {
            Some(up) => up.recv_block(compressed).await,
            None => Err(Error::NoActiveQuery),
        }
    }

    async fn recv_exception(&mut self) -> Result<Exception> {
        match &mut self.upstream {
            Some(up) => up.recv_exception().await,
            None => Err(Error::NoActiveQuery),
        }
    }

    async fn recv_progress(&mut self) -> Result<Progress> {
        match &mut self.upstream {
            Some(up) => up.recv_progress().await,
            None => Err(Error::NoActiveQuery),
        }
    }

    async fn recv_profile_info(&mut self) -> Result<ProfileInfo> {
        match &mut self.upstream {
            Some(up) => up.recv_profile_info().await,
            None => Err(Error::NoActiveQuery),
        }
    }

    fn credentials(&self) -> &Credentials {
        &self.creds
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
