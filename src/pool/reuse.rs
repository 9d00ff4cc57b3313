use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;

use crate::error::{Error, Result};
use crate::pool::{apply_credentials, Client, ClientOption, ClientPool};
use crate::wire::{default_credentials, Credentials};

/// Upper bound on idle connections kept per credentials key.
const DEFAULT_MAX_IDLE: usize = 4;

/// The reuse pool variant: healthy connections returned without an error go
/// into a small idle set keyed by their credentials and are handed out again
/// for matching requests.
pub struct ReusePool {
    inner: Arc<dyn ClientPool>,
    max_idle: usize,

    idle: Mutex<HashMap<Credentials, Vec<Box<dyn Client>>>>,
    closed: AtomicBool,
}

impl ReusePool {
    pub fn new(inner: Arc<dyn ClientPool>) -> Self {
        ReusePool {
            inner,
            max_idle: DEFAULT_MAX_IDLE,
            idle: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }
}

#[async_trait]
impl ClientPool for ReusePool {
    async fn get(&self, opts: &[ClientOption]) -> Result<Box<dyn Client>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let creds = apply_credentials(default_credentials(), opts);

        let reused = {
            let mut idle = self.idle.lock().expect("idle set poisoned");
            idle.get_mut(&creds).and_then(Vec::pop)
        };

        if let Some(client) = reused {
            debug!("reusing idle upstream connection: db={}", creds.database);
            return Ok(client);
        }

        self.inner.get(opts).await
    }

    async fn put(&self, client: Box<dyn Client>, err: Option<&Error>) -> Result<()> {
        if err.is_none() && !self.closed.load(Ordering::Acquire) {
            let creds = client.credentials().clone();
            let mut idle = self.idle.lock().expect("idle set poisoned");
            let slot = idle.entry(creds).or_default();
            if slot.len() < self.max_idle {
                slot.push(client);
                return Ok(());
            }
        }

        self.inner.put(client, err).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.idle.lock().expect("idle set poisoned").clear();
        self.inner.close().await
    }
}
