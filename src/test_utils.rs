//! Test Utilities Module
//!
//! Deterministic stand-ins for the remote node, plus helpers for building
//! throwaway stores. Only compiled for tests or with the `test_utils`
//! feature.

#![cfg(any(test, feature = "test_utils"))]

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::chain::oracle::LedgerOracle;
use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};
use crate::nonce_manager::nonce_store::NonceStore;
use crate::storage::TransactionLog;
use crate::types::{ChainAddress, Receipt, TxHash};

/// Well-known test wallet
pub const TEST_ADDRESS: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";

/// In-memory remote node
#[derive(Default)]
pub struct MockOracle {
    counts: DashMap<Address, u64>,
    receipts: DashMap<TxHash, Receipt>,
    known: DashSet<TxHash>,
    delay: Mutex<Option<Duration>>,
    unreachable: AtomicBool,
    count_calls: AtomicU64,
    receipt_calls: AtomicU64,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_count(&self, address: &Address, count: u64) {
        self.counts.insert(*address, count);
    }

    pub fn set_receipt(&self, tx_hash: TxHash, block_number: u64, success: bool) {
        self.known.insert(tx_hash);
        self.receipts.insert(
            tx_hash,
            Receipt {
                transaction_hash: tx_hash,
                block_number,
                success,
            },
        );
    }

    /// Transaction sits in the mempool: known, no receipt
    pub fn set_pending(&self, tx_hash: TxHash) {
        self.known.insert(tx_hash);
    }

    /// Every call sleeps this long first
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Every call fails with an oracle error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn count_calls(&self) -> u64 {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn receipt_calls(&self) -> u64 {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> NonceResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(NonceError::oracle(Some("mock"), "node unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerOracle for MockOracle {
    async fn get_confirmed_transaction_count(&self, address: &Address) -> NonceResult<u64> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        Ok(self.counts.get(address).map(|c| *c).unwrap_or(0))
    }

    async fn get_transaction_receipt(&self, tx_hash: &TxHash) -> NonceResult<Option<Receipt>> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        Ok(self.receipts.get(tx_hash).map(|r| r.clone()))
    }

    async fn is_transaction_known(&self, tx_hash: &TxHash) -> NonceResult<bool> {
        self.before_call().await?;
        Ok(self.known.contains(tx_hash))
    }

    fn endpoint(&self) -> &str {
        "mock"
    }
}

pub fn test_key() -> ChainAddress {
    ChainAddress::new("base", TEST_ADDRESS).expect("valid test address")
}

/// Distinct deterministic hash per nonce
pub fn tx_hash(nonce: u64) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&nonce.to_be_bytes());
    bytes[0] = 0xee;
    B256::from(bytes)
}

/// Nonce store and transaction log in a fresh temp directory
pub struct TestStorage {
    pub dir: TempDir,
    pub store: Arc<NonceStore>,
    pub log: Arc<TransactionLog>,
}

impl TestStorage {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let (store, log) = Self::open_in(&dir);
        Self { dir, store, log }
    }

    fn open_in(dir: &TempDir) -> (Arc<NonceStore>, Arc<TransactionLog>) {
        let store = NonceStore::open(&dir.path().join("nonce.db"), true).expect("nonce store");
        let log = TransactionLog::open(&dir.path().join("tx.db"), true).expect("tx log");
        (Arc::new(store), Arc::new(log))
    }

    /// Simulate a process restart: close, drop and reopen both databases
    pub async fn restart(self) -> Self {
        use crate::resource_registry::Closeable;
        let TestStorage { dir, store, log } = self;
        store.close().await.expect("close store");
        log.close().await.expect("close log");
        drop(store);
        drop(log);
        let (store, log) = Self::open_in(&dir);
        Self { dir, store, log }
    }
}

impl Default for TestStorage {
    fn default() -> Self {
        Self::new()
    }
}
