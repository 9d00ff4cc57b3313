use tokio::io::{AsyncRead, AsyncWrite};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::protocol::{
    self, ClientPacket, ServerPacket, DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO,
    DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE,
};
use crate::wire::{Agent, Block, Credentials, Exception, ProfileInfo, Progress, Query, QueryMeta};

pub type AuthFn = Box<dyn Fn(&Credentials) -> Result<()> + Send + Sync>;

/// Downstream-facing connection: presents the ClickHouse server protocol
/// to a connected client.
pub struct ServerConn<S> {
    conn: Conn<S>,

    /// Identity we advertise in the server Hello.
    pub server: Agent,
    pub timezone: String,

    /// Peer identity, learned at Hello.
    pub client: Agent,
    pub credentials: Credentials,

    pub auth: Option<AuthFn>,
}

impl<S: AsyncRead + AsyncWrite + Send> ServerConn<S> {
    pub fn new(stream: S) -> Self {
        ServerConn {
            conn: Conn::new(stream),
            server: protocol::default_server_agent(),
            timezone: "UTC".into(),
            client: Agent::default(),
            credentials: Credentials::default(),
            auth: None,
        }
    }

    /// Run the handshake: read the client Hello, authenticate, answer with
    /// our own. An auth failure is written back as a server exception.
    pub async fn hello(&mut self) -> Result<()> {
        let tp = self.conn.recv_packet().await?;
        if tp != ClientPacket::Hello.code() {
            return Err(Error::UnexpectedPacket(tp));
        }

        self.client = self.conn.recv_agent().await?;
        self.credentials = Credentials {
            database: self.conn.dec.string().await?,
            user: self.conn.dec.string().await?,
            password: self.conn.dec.string().await?,
        };

        if let Some(auth) = &self.auth {
            if let Err(err) = auth(&self.credentials) {
                let exc = Exception::from_error(&err);
                self.send_exception(&exc).await?;
                return Err(err);
            }
        }

        self.conn.send_packet(ServerPacket::Hello.code()).await?;
        self.conn.send_agent(&self.server).await?;
        // both peers must be past the gate or the field desyncs the stream
        if self.server.ver.revision.min(self.client.ver.revision)
            >= DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE
        {
            self.conn.enc.string(&self.timezone).await?;
        }

        self.conn.enc.flush().await
    }

    pub async fn next_packet(&mut self) -> Result<ClientPacket> {
        ClientPacket::try_from(self.conn.recv_packet().await?)
    }

    /// Consume one ClientQuery body, including the appended external-tables
    /// stream. Only the empty terminator table is accepted there.
    pub async fn recv_query(&mut self) -> Result<Query> {
        let id = self.conn.dec.string().await?;

        // client info: query kind, initial user/query id/address, interface,
        // os user, client hostname
        let _kind = self.conn.dec.uvarint().await?;
        let _initial_user = self.conn.dec.string().await?;
        let _initial_query_id = self.conn.dec.string().await?;
        let _initial_address = self.conn.dec.string().await?;
        let _interface = self.conn.dec.uvarint().await?;
        let _os_user = self.conn.dec.string().await?;
        let _client_hostname = self.conn.dec.string().await?;

        let client = self.conn.recv_agent().await?;

        let quota_key = if client.ver.revision.min(self.server.ver.revision)
            >= DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO
        {
            self.conn.dec.string().await?
        } else {
            String::new()
        };

        // settings terminator; named settings carry typed payloads we
        // cannot skip generically
        let setting = self.conn.dec.string().await?;
        if !setting.is_empty() {
            return Err(Error::UnsupportedSetting(setting));
        }

        let state = self.conn.dec.uvarint().await?;
        if state != protocol::STATE_COMPLETE {
            return Err(Error::BadQueryState(state));
        }

        let compressed = self.conn.dec.bool().await?;
        let sql = self.conn.dec.string().await?;

        let q = Query {
            sql,
            id,
            quota_key,
            compressed,
            client,
        };

        self.recv_ext_tables(&q).await?;

        Ok(q)
    }

    async fn recv_ext_tables(&mut self, q: &Query) -> Result<()> {
        let tp = self.next_packet().await?;
        if tp != ClientPacket::Data {
            return Err(Error::UnexpectedPacket(tp.code()));
        }

        let table = self.conn.dec.string().await?;

        if q.compressed {
            self.conn.dec.set_compressed(true);
        }
        let header = self.conn.recv_block_header().await;
        self.conn.dec.set_compressed(false);
        let (cols, rows) = header?;

        if table.is_empty() && cols == 0 && rows == 0 {
            return Ok(());
        }

        Err(Error::ExtTablesUnsupported)
    }

    pub async fn recv_block(&mut self, compressed: bool) -> Result<Block> {
        self.conn.recv_block(compressed).await
    }

    /// Write the upstream-declared column schema as a zero-row data block
    /// and flush: the client needs it before it will send insert data.
    pub async fn send_query_meta(&mut self, meta: &QueryMeta, compressed: bool) -> Result<()> {
        self.conn.send_packet(ServerPacket::Data.code()).await?;
        self.conn.enc.string("").await?;

        if compressed {
            self.conn.enc.set_compressed(true).await?;
        }

        self.conn.send_block_header(meta.len() as u64, 0).await?;
        for col in meta {
            self.conn.enc.string(&col.name).await?;
            self.conn.enc.string(&col.ty).await?;
        }

        self.conn.enc.set_compressed(false).await?;
        self.conn.enc.flush().await
    }

    pub async fn send_block(&mut self, b: &Block, compressed: bool) -> Result<()> {
        self.conn
            .send_block(ServerPacket::Data.code(), b, compressed)
            .await
    }

    pub async fn send_end_of_stream(&mut self) -> Result<()> {
        self.conn
            .send_packet(ServerPacket::EndOfStream.code())
            .await?;
        self.conn.enc.flush().await
    }

    pub async fn send_exception(&mut self, exc: &Exception) -> Result<()> {
        self.conn.send_packet(ServerPacket::Exception.code()).await?;
        self.conn.send_exception_chain(exc).await?;
        self.conn.enc.flush().await
    }

    pub async fn send_progress(&mut self, p: &Progress) -> Result<()> {
        self.conn.send_packet(ServerPacket::Progress.code()).await?;
        self.conn.send_progress_body(p).await?;
        self.conn.enc.flush().await
    }

    pub async fn send_profile_info(&mut self, p: &ProfileInfo) -> Result<()> {
        self.conn
            .send_packet(ServerPacket::ProfileInfo.code())
            .await?;
        self.conn.send_profile_info_body(p).await?;
        self.conn.enc.flush().await
    }

    /// Answer a Ping received between queries.
    pub async fn send_pong(&mut self) -> Result<()> {
        self.conn.send_packet(ServerPacket::Pong.code()).await?;
        self.conn.enc.flush().await
    }
}
