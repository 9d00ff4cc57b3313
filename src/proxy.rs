//! Per-connection session engine.
//!
//! Accepts downstream connections, performs the Hello handshake, then runs
//! one request state machine at a time: relay the query upstream, return the
//! declared meta, pump data blocks in (inserts) and response packets out,
//! preserving FIFO order in both directions.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conn::{ConnStats, CountedStream, ServerConn};
use crate::error::{Error, Result};
use crate::pool::{Client, ClientOption, ClientPool};
use crate::protocol::{self, ClientPacket, ServerPacket};
use crate::wire::{Agent, Credentials, Exception, Query};

pub type AuthHook = dyn Fn(&Credentials) -> Result<()> + Send + Sync;

#[derive(Clone)]
pub struct Proxy {
    pool: Arc<dyn ClientPool>,

    /// Identity presented to downstream clients.
    pub server: Agent,
    pub timezone: String,
    pub auth: Option<Arc<AuthHook>>,
}

impl Proxy {
    pub fn new(pool: Arc<dyn ClientPool>) -> Self {
        Proxy {
            pool,
            server: protocol::default_server_agent(),
            timezone: "UTC".into(),
            auth: None,
        }
    }

    /// Accept connections until the token fires, then wait for in-flight
    /// sessions to finish.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("listening on {}", listener.local_addr()?);

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => {
                    match res {
                        Ok((stream, peer)) => {
                            let proxy = self.clone();
                            let cancel = cancel.clone();
                            sessions.spawn(async move {
                                debug!("accepted {peer}");
                                if let Err(err) = proxy.handle_conn(stream, peer.to_string(), cancel).await {
                                    warn!("session {peer}: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("accept: {err}"),
                    }
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        while sessions.join_next().await.is_some() {}
        Ok(())
    }

    /// Run one downstream session to completion.
    pub async fn handle_conn<S>(
        &self,
        stream: S,
        peer: String,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let stats = Arc::new(ConnStats::default());
        let stream = CountedStream::new(stream, stats.clone());

        let mut sc = ServerConn::new(stream);
        sc.server = self.server.clone();
        sc.timezone = self.timezone.clone();
        if let Some(auth) = &self.auth {
            let auth = auth.clone();
            sc.auth = Some(Box::new(move |creds: &Credentials| auth(creds)));
        }

        sc.hello().await?;
        debug!(
            "client hello: {} {} db={} user={}",
            sc.client.name, sc.client.ver, sc.credentials.database, sc.credentials.user
        );

        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = self.handle_request(&mut sc, &stats, &peer) => r,
            };

            match res {
                Ok(()) => continue,
                Err(err) if err.is_eof() => return Ok(()),
                Err(err) => {
                    // the downstream may still be readable enough to learn why
                    let exc = Exception::from_error(&err);
                    let _ = sc.send_exception(&exc).await;
                    return Err(err);
                }
            }
        }
    }

    /// One request: Idle -> Q1 -> DATA (inserts) -> RESP.
    async fn handle_request<S>(
        &self,
        sc: &mut ServerConn<CountedStream<S>>,
        stats: &ConnStats,
        peer: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        match sc.next_packet().await? {
            ClientPacket::Query => {}
            ClientPacket::Ping => return sc.send_pong().await,
            p => return Err(Error::UnexpectedPacket(p.code())),
        }

        let q = sc.recv_query().await?;
        debug!(
            "query id={:?} compressed={} insert={}: {}",
            q.id,
            q.compressed,
            q.is_insert(),
            q.sql
        );

        let started = Instant::now();
        let before = stats.snapshot();

        let opts = [ClientOption::Credentials(sc.credentials.clone())];
        let mut client = self.pool.get(&opts).await?;

        let res = self.run_query(sc, client.as_mut(), &q, stats).await;

        if let Err(err) = self.pool.put(client, res.as_ref().err()).await {
            warn!("pool put: {err}");
        }

        let delta = stats.snapshot().since(&before);
        info!(
            "request peer={} id={:?} elapsed={:?} read={} written={} blocks={} rows={} ok={}",
            peer,
            q.id,
            started.elapsed(),
            delta.read_bytes,
            delta.written_bytes,
            delta.blocks,
            delta.rows,
            res.is_ok(),
        );

        match res {
            // already on the wire upstream; forward and keep the session
            Err(Error::Server(exc)) => {
                sc.send_exception(&exc).await?;
                Ok(())
            }
            other => other,
        }
    }

    async fn run_query<S>(
        &self,
        sc: &mut ServerConn<CountedStream<S>>,
        client: &mut dyn Client,
        q: &Query,
        stats: &ConnStats,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let meta = client.send_query(q).await?;
        sc.send_query_meta(&meta, q.compressed).await?;

        if q.is_insert() && !self.pump_insert(sc, client, q, stats).await? {
            // cancelled mid-insert, the request is over
            return Ok(());
        }

        self.pump_response(sc, client, q, stats).await
    }

    /// DATA state: forward client blocks upstream until the empty sentinel.
    /// Returns false when the client cancelled instead.
    async fn pump_insert<S>(
        &self,
        sc: &mut ServerConn<CountedStream<S>>,
        client: &mut dyn Client,
        q: &Query,
        stats: &ConnStats,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        loop {
            match sc.next_packet().await? {
                ClientPacket::Data => {
                    let b = sc.recv_block(q.compressed).await?;
                    let last = b.is_empty();

                    stats.add_block(&b);
                    client.send_block(&b, q.compressed).await?;

                    if last {
                        return Ok(true);
                    }
                }
                ClientPacket::Cancel => {
                    client.cancel_query().await?;
                    return Ok(false);
                }
                p => return Err(Error::UnexpectedPacket(p.code())),
            }
        }
    }

    /// RESP state: forward upstream packets until EndOfStream or Exception.
    async fn pump_response<S>(
        &self,
        sc: &mut ServerConn<CountedStream<S>>,
        client: &mut dyn Client,
        q: &Query,
        stats: &ConnStats,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        loop {
            match client.next_packet().await? {
                ServerPacket::Data => {
                    let b = client.recv_block(q.compressed).await?;
                    stats.add_block(&b);
                    sc.send_block(&b, q.compressed).await?;
                }
                ServerPacket::Progress => {
                    let p = client.recv_progress().await?;
                    sc.send_progress(&p).await?;
                }
                ServerPacket::ProfileInfo => {
                    let p = client.recv_profile_info().await?;
                    sc.send_profile_info(&p).await?;
                }
                ServerPacket::Exception => {
                    let exc = client.recv_exception().await?;
                    sc.send_exception(&exc).await?;
                    return Ok(());
                }
                ServerPacket::EndOfStream => return sc.send_end_of_stream().await,
                p => return Err(Error::UnexpectedPacket(p.code())),
            }
        }
    }
}
