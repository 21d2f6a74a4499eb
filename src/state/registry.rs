use crate::{
    auth::RequestSigner,
    client::ChannelClient,
    config::ClientConfig,
    settlement::ChainSettlement,
    transport::Connector,
    utils::{Clock, SystemClock},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

pub type SharedClient = Arc<Mutex<ChannelClient>>;

/// One [`ChannelClient`] per broker URL, shared by reference. Callers lock
/// the client for the duration of an operation, which keeps requests on a
/// connection strictly sequential.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, SharedClient>>>,
    connector: Arc<dyn Connector>,
    owner: Arc<dyn RequestSigner>,
    settlement: Arc<dyn ChainSettlement>,
    clock: Arc<dyn Clock>,
}

impl ClientRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        owner: Arc<dyn RequestSigner>,
        settlement: Arc<dyn ChainSettlement>,
    ) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            connector,
            owner,
            settlement,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Client for `config.broker_url`, created on first use. A later call
    /// for the same URL returns the same client regardless of `config`.
    pub async fn open(&self, config: ClientConfig) -> SharedClient {
        if let Some(existing) = self.clients.read().await.get(&config.broker_url) {
            return existing.clone();
        }
        let mut clients = self.clients.write().await;
        clients
            .entry(config.broker_url.clone())
            .or_insert_with(|| {
                debug!(url = %config.broker_url, "registering channel client");
                Arc::new(Mutex::new(
                    ChannelClient::new(
                        config.clone(),
                        self.connector.clone(),
                        self.owner.clone(),
                        self.settlement.clone(),
                    )
                    .with_clock(self.clock.clone()),
                ))
            })
            .clone()
    }

    pub async fn get(&self, url: &str) -> Option<SharedClient> {
        self.clients.read().await.get(url).cloned()
    }

    /// Closes and forgets the client for `url`. Returns whether one existed.
    pub async fn close(&self, url: &str) -> bool {
        let removed = self.clients.write().await.remove(url);
        match removed {
            Some(client) => {
                client.lock().await.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<SharedClient> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in drained {
            client.lock().await.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
