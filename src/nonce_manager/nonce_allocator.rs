//! Sequence allocator
//!
//! Public entry point for callers that build transactions. Every operation
//! runs inside the per-address section of the nonce store, so two callers
//! on the same address are strictly ordered and callers on different
//! addresses never wait on each other.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use super::nonce_errors::{NonceError, NonceResult};
use super::nonce_store::NonceStore;
use crate::metrics::{metrics, Timer};
use crate::storage::TransactionLog;
use crate::types::{ChainAddress, PendingTransactionEntry, TxHash, TxStatus};

fn unavailable(err: NonceError) -> NonceError {
    match err {
        unavailable @ NonceError::ResourceUnavailable(_) => unavailable,
        other => NonceError::ResourceUnavailable(other.to_string()),
    }
}

#[derive(Clone)]
pub struct SequenceAllocator {
    store: Arc<NonceStore>,
    log: Arc<TransactionLog>,
}

impl SequenceAllocator {
    pub fn new(store: Arc<NonceStore>, log: Arc<TransactionLog>) -> Self {
        Self { store, log }
    }

    pub fn store(&self) -> &Arc<NonceStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    /// Reserve the next nonce for `key`.
    ///
    /// A nonce the reconciler marked reclaimable is handed out first and
    /// leaves `next_nonce` alone. Otherwise `next_nonce` is reserved and the
    /// increment persisted. On failure no Reserved entry is left behind.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn allocate(&self, key: &ChainAddress) -> NonceResult<u64> {
        let timer = Timer::new();
        let _guard = self.store.lock(key).await?;

        let nonce = match self.log.reclaimable_entry(key)? {
            Some(expired) => {
                self.log
                    .record(&PendingTransactionEntry::reserved(key.clone(), expired.nonce))
                    .await
                    .map_err(unavailable)?;
                metrics().nonce_reclaimed_allocations.inc();
                info!(nonce = expired.nonce, "Reissued reclaimed nonce");
                expired.nonce
            }
            None => {
                let nonce = self.store.get(key).await.map_err(unavailable)?.next_nonce;
                self.log
                    .record(&PendingTransactionEntry::reserved(key.clone(), nonce))
                    .await
                    .map_err(unavailable)?;
                if let Err(err) = self.store.increment(key).await {
                    if let Err(rollback) = self.log.remove(key, nonce).await {
                        error!(nonce, error = %rollback, "Failed to roll back reservation");
                    }
                    return Err(unavailable(err));
                }
                nonce
            }
        };

        metrics().nonce_allocations.inc();
        timer.observe_duration(&metrics().allocate_latency);
        debug!(nonce, latency_ms = timer.elapsed_ms(), "Nonce allocated");
        Ok(nonce)
    }

    /// Record that the transaction using `nonce` was broadcast.
    ///
    /// Repeating the call with the same hash is accepted.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn confirm_submission(
        &self,
        key: &ChainAddress,
        nonce: u64,
        tx_hash: TxHash,
    ) -> NonceResult<()> {
        let _guard = self.store.lock(key).await?;
        if self
            .log
            .update_status(key, nonce, TxStatus::Submitted, Some(tx_hash))
            .await?
        {
            metrics().nonce_submissions.inc();
            return Ok(());
        }

        let current = self.current_status(key, nonce)?;
        match current {
            (TxStatus::Submitted, Some(existing)) if existing == tx_hash => Ok(()),
            (status, _) => Err(NonceError::InvalidTransition {
                key: key.to_string(),
                nonce,
                from: status.to_string(),
                to: TxStatus::Submitted.to_string(),
            }),
        }
    }

    /// Give back a reserved nonce that will not be submitted.
    ///
    /// `next_nonce` is never decremented; the nonce only comes back through
    /// the reconciler's reclaim. Releasing an expired entry is a no-op.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn release(&self, key: &ChainAddress, nonce: u64) -> NonceResult<()> {
        let _guard = self.store.lock(key).await?;
        if self
            .log
            .update_status(key, nonce, TxStatus::Expired, None)
            .await?
        {
            metrics().nonce_releases.inc();
            debug!(nonce, "Reservation released");
            return Ok(());
        }

        match self.current_status(key, nonce)? {
            (TxStatus::Expired, _) => Ok(()),
            (status, _) => Err(NonceError::InvalidTransition {
                key: key.to_string(),
                nonce,
                from: status.to_string(),
                to: TxStatus::Expired.to_string(),
            }),
        }
    }

    /// Reserved and Submitted entries, ascending by nonce
    pub fn list_outstanding(&self, key: &ChainAddress) -> NonceResult<Vec<PendingTransactionEntry>> {
        self.log.list_outstanding(key)
    }

    /// Allocate, hand the nonce to `submit`, then record the outcome.
    ///
    /// With `nonce_override` the caller already owns that nonce and `submit`
    /// runs without touching the store. Otherwise a successful submit marks
    /// the entry Submitted and a failed one releases it before the error is
    /// returned.
    pub async fn provide_nonce<F, Fut>(
        &self,
        key: &ChainAddress,
        nonce_override: Option<u64>,
        submit: F,
    ) -> anyhow::Result<(u64, TxHash)>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = anyhow::Result<TxHash>>,
    {
        if let Some(nonce) = nonce_override {
            let tx_hash = submit(nonce).await?;
            return Ok((nonce, tx_hash));
        }

        let nonce = self.allocate(key).await?;
        match submit(nonce).await {
            Ok(tx_hash) => {
                self.confirm_submission(key, nonce, tx_hash).await?;
                Ok((nonce, tx_hash))
            }
            Err(err) => {
                if let Err(release_err) = self.release(key, nonce).await {
                    error!(key = %key, nonce, error = %release_err, "Failed to release nonce after failed submit");
                }
                Err(err)
            }
        }
    }

    fn current_status(
        &self,
        key: &ChainAddress,
        nonce: u64,
    ) -> NonceResult<(TxStatus, Option<TxHash>)> {
        let entry = self.log.get(key, nonce)?.ok_or_else(|| NonceError::UnknownEntry {
            key: key.to_string(),
            nonce,
        })?;
        Ok((entry.status, entry.transaction_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_registry::Closeable;
    use crate::test_utils::{test_key, tx_hash, TestStorage};

    fn allocator(storage: &TestStorage) -> SequenceAllocator {
        SequenceAllocator::new(storage.store.clone(), storage.log.clone())
    }

    #[tokio::test]
    async fn test_allocate_reserves_and_increments() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        assert_eq!(allocator.allocate(&key).await.unwrap(), 0);
        assert_eq!(allocator.allocate(&key).await.unwrap(), 1);
        assert_eq!(storage.store.get(&key).await.unwrap().next_nonce, 2);

        let outstanding = allocator.list_outstanding(&key).unwrap();
        assert_eq!(outstanding.len(), 2);
        assert!(outstanding.iter().all(|e| e.status == TxStatus::Reserved));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_keeps_next_nonce() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        let nonce = allocator.allocate(&key).await.unwrap();
        allocator.release(&key, nonce).await.unwrap();
        allocator.release(&key, nonce).await.unwrap();

        let entry = storage.log.get(&key, nonce).unwrap().unwrap();
        assert_eq!(entry.status, TxStatus::Expired);
        assert!(!entry.reclaimable);
        assert_eq!(storage.store.get(&key).await.unwrap().next_nonce, 1);
        // Released nonces are not reused until the reconciler reclaims them
        assert_eq!(allocator.allocate(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_submitted_nonce_cannot_be_released() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        let nonce = allocator.allocate(&key).await.unwrap();
        allocator
            .confirm_submission(&key, nonce, tx_hash(nonce))
            .await
            .unwrap();
        // Same hash again is fine
        allocator
            .confirm_submission(&key, nonce, tx_hash(nonce))
            .await
            .unwrap();

        let err = allocator.release(&key, nonce).await.unwrap_err();
        assert!(matches!(err, NonceError::InvalidTransition { .. }));
        let err = allocator
            .confirm_submission(&key, nonce, tx_hash(99))
            .await
            .unwrap_err();
        assert!(matches!(err, NonceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_confirm_unknown_nonce_fails() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let err = allocator
            .confirm_submission(&test_key(), 4, tx_hash(4))
            .await
            .unwrap_err();
        assert!(matches!(err, NonceError::UnknownEntry { nonce: 4, .. }));
    }

    #[tokio::test]
    async fn test_reclaimable_nonce_is_reissued_first() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        for _ in 0..3 {
            allocator.allocate(&key).await.unwrap();
        }
        allocator.release(&key, 1).await.unwrap();
        storage.log.set_reclaimable(&key, Some(1)).await.unwrap();

        assert_eq!(allocator.allocate(&key).await.unwrap(), 1);
        assert_eq!(storage.store.get(&key).await.unwrap().next_nonce, 3);
        assert_eq!(allocator.allocate(&key).await.unwrap(), 3);

        let history = storage.log.history(&key, 1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TxStatus::Expired);
    }

    #[tokio::test]
    async fn test_allocate_after_close_leaves_no_entry() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        storage.store.close().await.unwrap();
        let err = allocator.allocate(&key).await.unwrap_err();
        assert!(matches!(err, NonceError::ResourceUnavailable(_)));
        assert!(storage.log.list_all(&key).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allocate_with_closed_log_is_unavailable() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        storage.log.close().await.unwrap();
        let err = allocator.allocate(&key).await.unwrap_err();
        assert!(matches!(err, NonceError::ResourceUnavailable(_)));
        assert_eq!(storage.store.get(&key).await.unwrap().next_nonce, 0);
    }

    #[tokio::test]
    async fn test_provide_nonce_confirms_on_success() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        let (nonce, hash) = allocator
            .provide_nonce(&key, None, |nonce| async move { Ok(tx_hash(nonce)) })
            .await
            .unwrap();
        assert_eq!(nonce, 0);
        let entry = storage.log.get(&key, 0).unwrap().unwrap();
        assert_eq!(entry.status, TxStatus::Submitted);
        assert_eq!(entry.transaction_hash, Some(hash));
    }

    #[tokio::test]
    async fn test_provide_nonce_releases_on_failure() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        let result = allocator
            .provide_nonce(&key, None, |_| async { Err(anyhow::anyhow!("simulation rejected")) })
            .await;
        assert!(result.is_err());
        assert_eq!(
            storage.log.get(&key, 0).unwrap().unwrap().status,
            TxStatus::Expired
        );
        assert!(allocator.list_outstanding(&key).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provide_nonce_with_override_skips_allocation() {
        let storage = TestStorage::new();
        let allocator = allocator(&storage);
        let key = test_key();

        let (nonce, _) = allocator
            .provide_nonce(&key, Some(42), |nonce| async move { Ok(tx_hash(nonce)) })
            .await
            .unwrap();
        assert_eq!(nonce, 42);
        assert!(storage.log.list_all(&key).unwrap().is_empty());
        assert_eq!(storage.store.get(&key).await.unwrap().next_nonce, 0);
    }
}
