//! Shared storage: the durable transaction log and the hub that opens each
//! storage path once and hands it out through the resource registry.

pub mod backend;
pub mod tx_log;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};
use crate::nonce_manager::nonce_store::NonceStore;
use crate::resource_registry::{Closeable, HandleId, ResourceId, ResourceRegistry};

pub use tx_log::TransactionLog;

const NONCE_STORE_KIND: &str = "nonce-store";
const TX_LOG_KIND: &str = "tx-log";

/// Opens every storage path at most once and tracks who holds it
pub struct StorageHub {
    registry: Arc<ResourceRegistry>,
    nonce_stores: Mutex<HashMap<PathBuf, Arc<NonceStore>>>,
    tx_logs: Mutex<HashMap<PathBuf, Arc<TransactionLog>>>,
    flush_on_write: bool,
}

impl StorageHub {
    pub fn new(registry: Arc<ResourceRegistry>, flush_on_write: bool) -> Self {
        Self {
            registry,
            nonce_stores: Mutex::new(HashMap::new()),
            tx_logs: Mutex::new(HashMap::new()),
            flush_on_write,
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Open (or reuse) the nonce store at `path` and declare `handle` as a holder
    pub fn attach_nonce_store(
        &self,
        path: &Path,
        handle: HandleId,
    ) -> NonceResult<(ResourceId, Arc<NonceStore>)> {
        let flush = self.flush_on_write;
        self.attach(&self.nonce_stores, NONCE_STORE_KIND, path, handle, |p| {
            NonceStore::open(p, flush)
        })
    }

    /// Open (or reuse) the transaction log at `path` and declare `handle` as a holder
    pub fn attach_transaction_log(
        &self,
        path: &Path,
        handle: HandleId,
    ) -> NonceResult<(ResourceId, Arc<TransactionLog>)> {
        let flush = self.flush_on_write;
        self.attach(&self.tx_logs, TX_LOG_KIND, path, handle, |p| {
            TransactionLog::open(p, flush)
        })
    }

    fn attach<T, F>(
        &self,
        cache: &Mutex<HashMap<PathBuf, Arc<T>>>,
        kind: &str,
        path: &Path,
        handle: HandleId,
        open: F,
    ) -> NonceResult<(ResourceId, Arc<T>)>
    where
        T: Closeable + 'static,
        F: FnOnce(&Path) -> NonceResult<T>,
    {
        let id = ResourceId::new(kind, path.display());
        let mut cache = cache.lock();

        if self.registry.is_open(&id) {
            if let Some(existing) = cache.get(path) {
                self.registry.declare_ownership(&id, handle)?;
                debug!(resource = %id, handle = %handle, "Reusing open storage");
                return Ok((id, existing.clone()));
            }
        }

        // Whatever is cached for this path has been closed by its last holder
        cache.remove(path);
        let resource = Arc::new(open(path)?);
        if !self.registry.register(id.clone(), resource.clone()) {
            return Err(NonceError::ResourceUnavailable(format!(
                "{} is still shutting down",
                id
            )));
        }
        self.registry.declare_ownership(&id, handle)?;
        cache.insert(path.to_path_buf(), resource.clone());
        Ok((id, resource))
    }
}
