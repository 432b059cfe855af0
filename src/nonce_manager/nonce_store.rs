//! Durable `(chain, address) -> next nonce` mapping
//!
//! Also owns the per-address critical sections: every mutation of an
//! address's next nonce or its outstanding set runs while holding the
//! [`AddressGuard`] returned by [`NonceStore::lock`].

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard};
use tracing::{debug, instrument, warn};

use super::nonce_errors::{NonceError, NonceResult};
use crate::resource_registry::Closeable;
use crate::storage::backend::SledBackend;
use crate::storage::TransactionLog;
use crate::types::{ChainAddress, NonceRecord};

const RECORDS_TREE: &str = "nonces";

/// Held for the duration of one critical section on one address.
///
/// Also holds the store's drain gate, so the store cannot close underneath it.
pub struct AddressGuard {
    key: ChainAddress,
    _section: OwnedMutexGuard<()>,
    _drain: OwnedRwLockReadGuard<()>,
}

impl AddressGuard {
    pub fn key(&self) -> &ChainAddress {
        &self.key
    }
}

pub struct NonceStore {
    backend: SledBackend,
    sections: DashMap<ChainAddress, Arc<Mutex<()>>>,
}

impl NonceStore {
    pub fn open(path: &Path, flush_on_write: bool) -> NonceResult<Self> {
        let backend = SledBackend::open(path, flush_on_write, &[RECORDS_TREE])?;
        Ok(Self {
            backend,
            sections: DashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.backend.path()
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }

    /// Enter the critical section for `key`.
    ///
    /// Sections for different addresses never block each other.
    pub async fn lock(&self, key: &ChainAddress) -> NonceResult<AddressGuard> {
        let drain = self.backend.enter().await?;
        let section = self
            .sections
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let section = section.lock_owned().await;
        Ok(AddressGuard {
            key: key.clone(),
            _section: section,
            _drain: drain,
        })
    }

    /// Current record, created zero-valued on first access
    pub async fn get(&self, key: &ChainAddress) -> NonceResult<NonceRecord> {
        self.backend.ensure_open()?;
        if let Some(record) = self.read(key)? {
            return Ok(record);
        }
        let record = NonceRecord::new(key.clone());
        self.write(&record).await?;
        debug!(key = %key, "Created nonce record");
        Ok(record)
    }

    /// Overwrite `next_nonce` after reconciliation established the truth.
    ///
    /// Rejects any value at or below the highest Submitted/Confirmed nonce in
    /// `log`, since handing that out again would collide with a broadcast
    /// transaction.
    #[instrument(skip(self, key, log), fields(key = %key))]
    pub async fn set_next(
        &self,
        key: &ChainAddress,
        value: u64,
        log: &TransactionLog,
    ) -> NonceResult<NonceRecord> {
        if let Some(floor) = log.highest_committed(key)? {
            if value <= floor {
                crate::metrics::metrics().nonce_stale_writes.inc();
                warn!(attempted = value, floor, "Rejected stale nonce write");
                return Err(NonceError::StaleWrite {
                    key: key.to_string(),
                    attempted: value,
                    floor,
                });
            }
        }
        let mut record = self.get(key).await?;
        record.next_nonce = value;
        record.last_synced_at = Some(Utc::now());
        self.write(&record).await?;
        debug!(next_nonce = value, "Next nonce overwritten");
        Ok(record)
    }

    /// Advance `next_nonce` by one; returns the updated record
    pub(crate) async fn increment(&self, key: &ChainAddress) -> NonceResult<NonceRecord> {
        let mut record = self.get(key).await?;
        record.next_nonce = record.next_nonce.checked_add(1).ok_or_else(|| {
            NonceError::Internal(format!("nonce overflow for {}", key))
        })?;
        self.write(&record).await?;
        Ok(record)
    }

    /// Stamp `last_synced_at` without touching the nonce
    pub async fn touch_synced(&self, key: &ChainAddress) -> NonceResult<NonceRecord> {
        let mut record = self.get(key).await?;
        record.last_synced_at = Some(Utc::now());
        self.write(&record).await?;
        Ok(record)
    }

    fn read(&self, key: &ChainAddress) -> NonceResult<Option<NonceRecord>> {
        match self.backend.tree(RECORDS_TREE)?.get(key.storage_prefix())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, record: &NonceRecord) -> NonceResult<()> {
        self.backend
            .tree(RECORDS_TREE)?
            .insert(record.key.storage_prefix(), bincode::serialize(record)?)?;
        self.backend.persist().await
    }
}

#[async_trait]
impl Closeable for NonceStore {
    async fn close(&self) -> NonceResult<()> {
        self.backend.drain_and_close().await.map(|_| ())
    }
}
