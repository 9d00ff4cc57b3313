use std::any::Any;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::pool::Client;
use crate::protocol::{
    self, ClientPacket, ServerPacket, DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO,
    DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE,
};
use crate::wire::{Agent, Block, Credentials, ProfileInfo, Progress, Query, QueryMeta};

static HOSTNAME: Lazy<String> = Lazy::new(|| {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
});

/// Upstream-facing connection: speaks the protocol as a client against a
/// real ClickHouse server.
pub struct ClientConn<S> {
    conn: Conn<S>,

    /// Identity we present in the client Hello.
    pub client: Agent,
    pub credentials: Credentials,

    /// Peer identity, learned at Hello.
    pub server: Agent,
    pub timezone: String,
}

impl<S: AsyncRead + AsyncWrite + Send> ClientConn<S> {
    pub fn new(stream: S) -> Self {
        ClientConn {
            conn: Conn::new(stream),
            client: protocol::default_client_agent(),
            credentials: crate::wire::default_credentials(),
            server: Agent::default(),
            timezone: String::new(),
        }
    }

    pub async fn hello(&mut self) -> Result<()> {
        self.conn.send_packet(ClientPacket::Hello.code()).await?;
        self.conn.send_agent(&self.client).await?;
        self.conn.enc.string(&self.credentials.database).await?;
        self.conn.enc.string(&self.credentials.user).await?;
        self.conn.enc.string(&self.credentials.password).await?;
        self.conn.enc.flush().await?;

        match self.next_server_packet().await? {
            ServerPacket::Hello => {
                self.server = self.conn.recv_agent().await?;
                // mirror of the server-side gate on both revisions
                if self.server.ver.revision.min(self.client.ver.revision)
                    >= DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE
                {
                    self.timezone = self.conn.dec.string().await?;
                }
                Ok(())
            }
            ServerPacket::Exception => Err(Error::Server(self.conn.recv_exception().await?)),
            p => Err(Error::UnexpectedPacket(p.code())),
        }
    }

    async fn next_server_packet(&mut self) -> Result<ServerPacket> {
        ServerPacket::try_from(self.conn.recv_packet().await?)
    }

    async fn send_query_body(&mut self, q: &Query) -> Result<()> {
        self.conn.send_packet(ClientPacket::Query.code()).await?;
        self.conn.enc.string(&q.id).await?;

        // client info: initial query over TCP, originated here
        self.conn.enc.uvarint(1).await?;
        self.conn.enc.string("").await?;
        self.conn.enc.string("").await?;
        self.conn.enc.string("localhost:0").await?;
        self.conn.enc.uvarint(1).await?;
        self.conn.enc.string(&HOSTNAME).await?;
        self.conn.enc.string(&HOSTNAME).await?;
        self.conn.send_agent(&self.client).await?;

        if self.server.ver.revision.min(self.client.ver.revision)
            >= DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO
        {
            self.conn.enc.string(&q.quota_key).await?;
        }

        self.conn.enc.string("").await?; // settings terminator
        self.conn.enc.uvarint(protocol::STATE_COMPLETE).await?;
        self.conn.enc.bool(q.compressed).await?;
        self.conn.enc.string(&q.sql).await?;

        // the empty data block opens the data phase
        self.conn
            .send_empty_block(ClientPacket::Data.code(), q.compressed)
            .await
    }

    async fn recv_meta(&mut self, q: &Query) -> Result<QueryMeta> {
        let _table = self.conn.dec.string().await?;

        if q.compressed {
            self.conn.dec.set_compressed(true);
        }
        let res = self.recv_meta_body().await;
        self.conn.dec.set_compressed(false);
        res
    }

    /// Liveness probe, answered with Pong outside of a query.
    pub async fn send_ping(&mut self) -> Result<()> {
        self.conn.send_packet(ClientPacket::Ping.code()).await?;
        self.conn.enc.flush().await
    }

    async fn recv_meta_body(&mut self) -> Result<QueryMeta> {
        let (cols, rows) = self.conn.recv_block_header().await?;
        if rows != 0 {
            return Err(Error::MetaHasRows(rows));
        }

        let mut meta = QueryMeta::with_capacity(cols as usize);
        for _ in 0..cols {
            meta.push(crate::wire::Column {
                name: self.conn.dec.string().await?,
                ty: self.conn.dec.string().await?,
                raw: Vec::new(),
            });
        }
        Ok(meta)
    }
}

#[async_trait]
impl<S> Client for ClientConn<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn next_packet(&mut self) -> Result<ServerPacket> {
        self.next_server_packet().await
    }

    /// Ship the query and return the column meta the server declares.
    /// A server exception at this stage surfaces as [`Error::Server`].
    async fn send_query(&mut self, q: &Query) -> Result<QueryMeta> {
        self.send_query_body(q).await?;
        self.conn.enc.flush().await?;

        match self.next_server_packet().await? {
            ServerPacket::Data => self.recv_meta(q).await,
            ServerPacket::Exception => Err(Error::Server(self.conn.recv_exception().await?)),
            p => Err(Error::UnexpectedPacket(p.code())),
        }
    }

    async fn cancel_query(&mut self) -> Result<()> {
        self.conn.send_packet(ClientPacket::Cancel.code()).await?;
        self.conn.enc.flush().await
    }

    async fn send_block(&mut self, b: &Block, compressed: bool) -> Result<()> {
        self.conn
            .send_block(ClientPacket::Data.code(), b, compressed)
            .await?;

        // the empty sentinel ends the insert, nothing else follows
        if b.is_empty() {
            self.conn.enc.flush().await?;
        }
        Ok(())
    }

    async fn recv_block(&mut self, compressed: bool) -> Result<Block> {
        self.conn.recv_block(compressed).await
    }

    async fn recv_exception(&mut self) -> Result<crate::wire::Exception> {
        self.conn.recv_exception().await
    }

    async fn recv_progress(&mut self) -> Result<Progress> {
        self.conn.recv_progress().await
    }

    async fn recv_profile_info(&mut self) -> Result<ProfileInfo> {
        self.conn.recv_profile_info().await
    }

    fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
