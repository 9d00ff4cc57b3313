use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::TcpStream;

use crate::conn::ClientConn;
use crate::error::{Error, Result};
use crate::pool::{Client, ClientOption, ClientPool};
use crate::wire::{default_credentials, Credentials};

/// The simple pool variant: dial a fresh upstream connection per `get`,
/// close it on `put`.
pub struct BinaryPool {
    addr: String,

    pub agent_name: String,
    pub credentials: Credentials,
}

impl BinaryPool {
    pub fn new(addr: impl Into<String>) -> Self {
        BinaryPool {
            addr: addr.into(),
            agent_name: "clickhouse-proxy".into(),
            credentials: default_credentials(),
        }
    }
}

#[async_trait]
impl ClientPool for BinaryPool {
    async fn get(&self, opts: &[ClientOption]) -> Result<Box<dyn Client>> {
        let mut creds = self.credentials.clone();
        let mut agent_name = self.agent_name.clone();

        for opt in opts {
            match opt {
                ClientOption::Credentials(c) => creds = c.clone(),
                ClientOption::Database(db) => creds.database = db.clone(),
                ClientOption::AgentName(name) => agent_name = name.clone(),
            }
        }

        debug!("dial upstream {}", self.addr);
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;

        let mut client = ClientConn::new(stream);
        client.client.name = agent_name;
        client.credentials = creds;

        client.hello().await?;
        debug!(
            "upstream hello: {} {} timezone={}",
            client.server.name, client.server.ver, client.timezone
        );

        Ok(Box::new(client))
    }

    async fn put(&self, client: Box<dyn Client>, err: Option<&Error>) -> Result<()> {
        if let Some(err) = err {
            warn!("discarding upstream connection: {err}");
        }
        drop(client);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
