//! One connected EVM network
//!
//! A connector holds one ownership handle on the shared nonce store and
//! transaction log, runs the startup sync for its wallets once, and owns
//! the reconciler loop for its chain.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::descriptor::ChainDescriptor;
use super::oracle::LedgerOracle;
use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};
use crate::nonce_manager::{NonceReconciler, ReconcilerConfig, SequenceAllocator};
use crate::resource_registry::{HandleId, ResourceId, ResourceRegistry};
use crate::storage::StorageHub;
use crate::types::{ChainAddress, PendingTransactionEntry, TxHash};

/// Where a connector is in its one-time initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
    /// Last attempt failed; the next `init` call tries again
    Failed(String),
    Closed,
}

/// Paths and timing shared by every connector of a registry
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub nonce_db_path: std::path::PathBuf,
    pub transaction_db_path: std::path::PathBuf,
    pub reconciler: ReconcilerConfig,
}

pub struct ChainConnector {
    descriptor: ChainDescriptor,
    handle: HandleId,
    resources: Arc<ResourceRegistry>,
    store_id: ResourceId,
    log_id: ResourceId,
    allocator: SequenceAllocator,
    reconciler: Arc<NonceReconciler>,
    oracle: Arc<dyn LedgerOracle>,
    /// Set once the first sync for a wallet has succeeded; callers racing
    /// on a new wallet all wait for that one sync
    synced: DashMap<ChainAddress, Arc<OnceCell<()>>>,
    state: Mutex<InitState>,
    state_tx: watch::Sender<InitState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Marks an abandoned init run as failed so waiters are not stuck forever
struct InitRun<'a> {
    connector: &'a ChainConnector,
    finished: bool,
}

impl Drop for InitRun<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.connector
                .set_state(InitState::Failed("initialization cancelled".to_string()));
        }
    }
}

impl ChainConnector {
    /// Attach to the shared storage under a fresh handle.
    ///
    /// Nothing talks to the node until [`init`](Self::init).
    pub async fn connect(
        descriptor: ChainDescriptor,
        storage: &StorageHub,
        settings: &ConnectorSettings,
        oracle: Arc<dyn LedgerOracle>,
    ) -> NonceResult<Arc<Self>> {
        descriptor.validate()?;
        let resources = storage.registry().clone();
        let handle = resources.create_handle();

        let (store_id, store) = storage.attach_nonce_store(&settings.nonce_db_path, handle)?;
        let (log_id, log) = match storage.attach_transaction_log(&settings.transaction_db_path, handle) {
            Ok(attached) => attached,
            Err(err) => {
                resources.close(&store_id, handle).await?;
                return Err(err);
            }
        };

        let allocator = SequenceAllocator::new(store.clone(), log.clone());
        let reconciler = Arc::new(NonceReconciler::new(
            store,
            log,
            oracle.clone(),
            settings.reconciler.clone(),
        ));
        let (state_tx, _) = watch::channel(InitState::Uninitialized);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            chain = %descriptor.ledger_id(),
            chain_id = descriptor.chain_id,
            handle = %handle,
            "Chain connector attached"
        );
        Ok(Arc::new(Self {
            descriptor,
            handle,
            resources,
            store_id,
            log_id,
            allocator,
            reconciler,
            oracle,
            synced: DashMap::new(),
            state: Mutex::new(InitState::Uninitialized),
            state_tx,
            shutdown_tx,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn descriptor(&self) -> &ChainDescriptor {
        &self.descriptor
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn allocator(&self) -> &SequenceAllocator {
        &self.allocator
    }

    pub fn reconciler(&self) -> &Arc<NonceReconciler> {
        &self.reconciler
    }

    pub fn oracle(&self) -> &Arc<dyn LedgerOracle> {
        &self.oracle
    }

    pub fn state(&self) -> InitState {
        self.state.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock() == InitState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> NonceError {
        NonceError::ResourceUnavailable(format!(
            "{} connector is closed",
            self.descriptor.ledger_id()
        ))
    }

    fn ensure_open(&self) -> NonceResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn set_state(&self, next: InitState) {
        let mut state = self.state.lock();
        // Closed is final
        if *state == InitState::Closed {
            return;
        }
        *state = next.clone();
        self.state_tx.send_replace(next);
    }

    /// Sync every configured wallet with the node and start the reconciler.
    ///
    /// Runs at most once at a time: concurrent callers wait for the run in
    /// flight and get its outcome. After a failure the next call retries.
    pub async fn init(&self) -> NonceResult<()> {
        let mut waiter = {
            let mut state = self.state.lock();
            match state.clone() {
                InitState::Ready => return Ok(()),
                InitState::Closed => return Err(self.closed_error()),
                InitState::Initializing => Some(self.state_tx.subscribe()),
                InitState::Uninitialized | InitState::Failed(_) => {
                    *state = InitState::Initializing;
                    self.state_tx.send_replace(InitState::Initializing);
                    None
                }
            }
        };

        let Some(waiter) = waiter.as_mut() else {
            return self.run_init().await;
        };
        let settled = waiter
            .wait_for(|s| *s != InitState::Initializing)
            .await
            .map(|s| (*s).clone())
            .map_err(|_| NonceError::Internal("init state channel closed".to_string()))?;
        match settled {
            InitState::Ready => Ok(()),
            InitState::Failed(reason) => Err(NonceError::ResourceUnavailable(reason)),
            other => Err(NonceError::ResourceUnavailable(format!(
                "{} connector is {:?}",
                self.descriptor.ledger_id(),
                other
            ))),
        }
    }

    #[instrument(skip(self), fields(chain = %self.descriptor.ledger_id()))]
    async fn run_init(&self) -> NonceResult<()> {
        let mut run = InitRun {
            connector: self,
            finished: false,
        };

        let result = self.sync_tracked().await;
        run.finished = true;
        match &result {
            Ok(()) => {
                self.start_reconciler();
                self.set_state(InitState::Ready);
                info!(addresses = self.descriptor.addresses.len(), "Chain connector ready");
            }
            Err(err) => {
                error!(error = %err, "Failed to initialize chain connector");
                self.set_state(InitState::Failed(err.to_string()));
            }
        }
        result
    }

    async fn sync_tracked(&self) -> NonceResult<()> {
        for key in self.descriptor.tracked_addresses()? {
            self.reconciler.track(key.clone());
            let outcome = self.reconciler.sync_address(&key).await?;
            // A later wallet may fail; this one stays synced
            let _ = self.sync_gate(&key).set(());
            debug!(key = %key, ?outcome, "Startup sync finished");
        }
        Ok(())
    }

    fn sync_gate(&self, key: &ChainAddress) -> Arc<OnceCell<()>> {
        self.synced.entry(key.clone()).or_default().clone()
    }

    fn start_reconciler(&self) {
        let mut task = self.task.lock();
        if task.is_none() {
            let handle = self.reconciler.clone().spawn(self.shutdown_tx.subscribe());
            *task = Some(handle);
        }
    }

    /// Resolve `address` on this chain. Wallets first seen here are synced
    /// with the node before anything is handed out for them.
    ///
    /// Concurrent callers on a new wallet share one sync. If it fails they
    /// all get the error and the next caller tries again.
    async fn prepare(&self, address: &str) -> NonceResult<ChainAddress> {
        self.init().await?;
        let key = self.descriptor.chain_address(address)?;
        let gate = self.sync_gate(&key);
        gate.get_or_try_init(|| async {
            let outcome = self.reconciler.sync_address(&key).await?;
            debug!(key = %key, ?outcome, "First sync for wallet finished");
            Ok::<_, NonceError>(())
        })
        .await?;
        self.reconciler.track(key.clone());
        Ok(key)
    }

    pub async fn allocate(&self, address: &str) -> NonceResult<u64> {
        let key = self.prepare(address).await?;
        self.allocator.allocate(&key).await
    }

    pub async fn confirm_submission(
        &self,
        address: &str,
        nonce: u64,
        tx_hash: TxHash,
    ) -> NonceResult<()> {
        self.ensure_open()?;
        let key = self.descriptor.chain_address(address)?;
        self.allocator.confirm_submission(&key, nonce, tx_hash).await
    }

    pub async fn release(&self, address: &str, nonce: u64) -> NonceResult<()> {
        self.ensure_open()?;
        let key = self.descriptor.chain_address(address)?;
        self.allocator.release(&key, nonce).await
    }

    pub fn list_outstanding(&self, address: &str) -> NonceResult<Vec<PendingTransactionEntry>> {
        self.ensure_open()?;
        let key = self.descriptor.chain_address(address)?;
        self.allocator.list_outstanding(&key)
    }

    /// See [`SequenceAllocator::provide_nonce`]
    pub async fn provide_nonce<F, Fut>(
        &self,
        address: &str,
        nonce_override: Option<u64>,
        submit: F,
    ) -> anyhow::Result<(u64, TxHash)>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = anyhow::Result<TxHash>>,
    {
        let key = self.prepare(address).await?;
        self.allocator.provide_nonce(&key, nonce_override, submit).await
    }

    /// Stop the reconciler and give up this connector's hold on the shared
    /// storage. The storage itself closes when its last holder lets go.
    ///
    /// Calling it again does nothing.
    pub async fn close(&self) -> NonceResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(InitState::Closed);

        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "Reconciler task ended abnormally");
            }
        }

        let store_closed = self.resources.close(&self.store_id, self.handle).await;
        let log_closed = self.resources.close(&self.log_id, self.handle).await;
        info!(
            chain = %self.descriptor.ledger_id(),
            handle = %self.handle,
            "Chain connector closed"
        );
        store_closed?;
        log_closed?;
        Ok(())
    }
}
