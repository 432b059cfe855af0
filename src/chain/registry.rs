//! Process-wide table of chain connectors keyed by `(chain, network)`

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::connector::{ChainConnector, ConnectorSettings};
use super::descriptor::ChainDescriptor;
use super::oracle::LedgerOracle;
use crate::metrics::metrics;
use crate::nonce_manager::nonce_errors::NonceResult;
use crate::resource_registry::ResourceRegistry;
use crate::storage::StorageHub;

/// Owns the resource registry, the storage hub and every live connector.
///
/// There is no hidden global instance; the daemon builds one of these and
/// passes it around.
pub struct ConnectorRegistry {
    storage: StorageHub,
    settings: ConnectorSettings,
    connectors: Mutex<HashMap<(String, String), Arc<ChainConnector>>>,
}

impl ConnectorRegistry {
    pub fn new(settings: ConnectorSettings, flush_on_write: bool) -> Self {
        let resources = Arc::new(ResourceRegistry::new());
        Self {
            storage: StorageHub::new(resources, flush_on_write),
            settings,
            connectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        self.storage.registry()
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// The live connector for `descriptor`'s `(chain, network)`, creating
    /// and attaching one if there is none
    pub async fn get_or_create(
        &self,
        descriptor: ChainDescriptor,
        oracle: Arc<dyn LedgerOracle>,
    ) -> NonceResult<Arc<ChainConnector>> {
        let key = descriptor.key();
        let mut connectors = self.connectors.lock().await;
        if let Some(existing) = connectors.get(&key) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }

        let connector =
            ChainConnector::connect(descriptor, &self.storage, &self.settings, oracle).await?;
        connectors.insert(key, connector.clone());
        metrics().connected_chains.set(connectors.len() as i64);
        Ok(connector)
    }

    pub async fn get(&self, chain: &str, network: &str) -> Option<Arc<ChainConnector>> {
        self.connectors
            .lock()
            .await
            .get(&(chain.to_string(), network.to_string()))
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Every live connector, ordered by `(chain, network)`
    pub async fn connected_instances(&self) -> Vec<Arc<ChainConnector>> {
        let connectors = self.connectors.lock().await;
        let mut live: Vec<_> = connectors
            .iter()
            .filter(|(_, c)| !c.is_closed())
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live.into_iter().map(|(_, c)| c).collect()
    }

    /// Close and forget one connector; returns false if it was not registered
    pub async fn disconnect(&self, chain: &str, network: &str) -> NonceResult<bool> {
        let removed = {
            let mut connectors = self.connectors.lock().await;
            let removed = connectors.remove(&(chain.to_string(), network.to_string()));
            metrics().connected_chains.set(connectors.len() as i64);
            removed
        };
        match removed {
            Some(connector) => {
                connector.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every connector. Shared storage closes once the last one lets go.
    ///
    /// Keeps going past individual failures and returns the first one.
    pub async fn shutdown_all(&self) -> NonceResult<()> {
        let drained: Vec<_> = {
            let mut connectors = self.connectors.lock().await;
            let drained = connectors.drain().collect();
            metrics().connected_chains.set(0);
            drained
        };

        let mut first_error = None;
        for ((chain, network), connector) in drained {
            if let Err(err) = connector.close().await {
                warn!(chain = %chain, network = %network, error = %err, "Connector failed to close cleanly");
                first_error.get_or_insert(err);
            }
        }
        info!("All chain connectors closed");
        first_error.map_or(Ok(()), Err)
    }
}
