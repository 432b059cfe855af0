//! Concurrency tests for nonce allocation
//!
//! - Parallel allocate on one address yields a contiguous run
//! - Different addresses do not serialize behind each other
//! - Close waits for in-flight allocations

#[cfg(test)]
mod nonce_concurrency_tests {
    use crate::chain::oracle::LedgerOracle;
    use crate::nonce_manager::{NonceError, NonceReconciler, ReconcilerConfig, RetryConfig, SequenceAllocator};
    use crate::resource_registry::Closeable;
    use crate::test_utils::{test_key, tx_hash, MockOracle, TestStorage};
    use crate::types::{ChainAddress, TxStatus};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Parallel allocate on the same address
    ///
    /// Requirements:
    /// - 200 concurrent callers
    /// - Every nonce handed out exactly once
    /// - Nonces form the run 0..200 with no gaps
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_allocate_is_contiguous() {
        const NUM_OPERATIONS: u64 = 200;

        let storage = TestStorage::new();
        let allocator = SequenceAllocator::new(storage.store.clone(), storage.log.clone());
        let key = test_key();

        let mut handles = Vec::new();
        for _ in 0..NUM_OPERATIONS {
            let allocator = allocator.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { allocator.allocate(&key).await }));
        }

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap().unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..NUM_OPERATIONS).collect::<Vec<_>>());
        assert_eq!(
            storage.store.get(&key).await.unwrap().next_nonce,
            NUM_OPERATIONS
        );
        assert_eq!(
            allocator.list_outstanding(&key).unwrap().len(),
            NUM_OPERATIONS as usize
        );
    }

    /// Scenario D: two simultaneous callers get distinct sequential nonces
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_simultaneous_allocations() {
        let storage = TestStorage::new();
        let allocator = SequenceAllocator::new(storage.store.clone(), storage.log.clone());
        let key = test_key();
        storage.store.set_next(&key, 41, &storage.log).await.unwrap();

        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let spawn = |allocator: SequenceAllocator, key: ChainAddress, barrier: Arc<tokio::sync::Barrier>| {
            tokio::spawn(async move {
                barrier.wait().await;
                allocator.allocate(&key).await
            })
        };
        let a = spawn(allocator.clone(), key.clone(), barrier.clone());
        let b = spawn(allocator.clone(), key.clone(), barrier);

        let mut got = vec![a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        got.sort_unstable();
        assert_eq!(got, vec![41, 42]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_addresses_allocate_independently() {
        const ADDRESSES: usize = 8;
        const PER_ADDRESS: u64 = 25;

        let storage = TestStorage::new();
        let allocator = SequenceAllocator::new(storage.store.clone(), storage.log.clone());
        let keys: Vec<ChainAddress> = (0..ADDRESSES)
            .map(|i| {
                let mut bytes = [0u8; 20];
                bytes[19] = i as u8 + 1;
                ChainAddress::from_parts("base/mainnet", bytes.into()).unwrap()
            })
            .collect();

        let mut handles = Vec::new();
        for key in &keys {
            for _ in 0..PER_ADDRESS {
                let allocator = allocator.clone();
                let key = key.clone();
                handles.push(tokio::spawn(async move {
                    let nonce = allocator.allocate(&key).await?;
                    Ok::<_, NonceError>((key, nonce))
                }));
            }
        }

        let mut seen: HashSet<(ChainAddress, u64)> = HashSet::new();
        for handle in handles {
            let pair = handle.await.unwrap().unwrap();
            assert!(seen.insert(pair), "nonce handed out twice");
        }
        for key in &keys {
            assert_eq!(storage.store.get(key).await.unwrap().next_nonce, PER_ADDRESS);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_held_section_does_not_block_other_address() {
        let storage = TestStorage::new();
        let allocator = SequenceAllocator::new(storage.store.clone(), storage.log.clone());
        let busy = test_key();
        let other = ChainAddress::new("base", "0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359").unwrap();

        let _held = storage.store.lock(&busy).await.unwrap();
        let result = timeout(Duration::from_millis(500), allocator.allocate(&other)).await;
        assert_eq!(result.expect("other address not blocked").unwrap(), 0);

        let blocked = timeout(Duration::from_millis(50), allocator.allocate(&busy)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_drains_inflight_allocations() {
        let storage = TestStorage::new();
        let allocator = SequenceAllocator::new(storage.store.clone(), storage.log.clone());
        let key = test_key();

        let guard = storage.store.lock(&key).await.unwrap();
        let pending = {
            let allocator = allocator.clone();
            let key = key.clone();
            tokio::spawn(async move { allocator.allocate(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closer = {
            let store = storage.store.clone();
            tokio::spawn(async move { store.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());

        drop(guard);
        // The allocation queued before close still completes
        assert_eq!(pending.await.unwrap().unwrap(), 0);
        closer.await.unwrap().unwrap();

        assert!(matches!(
            allocator.allocate(&key).await,
            Err(NonceError::ResourceUnavailable(_))
        ));
    }

    /// Allocations keep flowing while the reconciler settles receipts
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_allocate_while_reconciling() {
        let storage = TestStorage::new();
        let oracle = Arc::new(MockOracle::new());
        oracle.set_delay(Some(Duration::from_millis(5)));
        let allocator = SequenceAllocator::new(storage.store.clone(), storage.log.clone());
        let reconciler = Arc::new(NonceReconciler::new(
            storage.store.clone(),
            storage.log.clone(),
            oracle.clone() as Arc<dyn LedgerOracle>,
            ReconcilerConfig {
                staleness_window: Duration::ZERO,
                retry: RetryConfig::none(),
                ..ReconcilerConfig::default()
            },
        ));
        let key = test_key();

        for nonce in 0..20u64 {
            assert_eq!(allocator.allocate(&key).await.unwrap(), nonce);
            allocator
                .confirm_submission(&key, nonce, tx_hash(nonce))
                .await
                .unwrap();
            oracle.set_receipt(tx_hash(nonce), 1000 + nonce, true);
        }
        oracle.set_count(key.address(), 20);

        let pass = {
            let reconciler = reconciler.clone();
            let key = key.clone();
            tokio::spawn(async move { reconciler.run_pass(&key).await })
        };
        let mut fresh = Vec::new();
        for _ in 0..20 {
            fresh.push(allocator.allocate(&key).await.unwrap());
        }
        let report = pass.await.unwrap().unwrap();

        assert_eq!(fresh, (20..40).collect::<Vec<_>>());
        assert_eq!(report.confirmed, 20);
        let entries = storage.log.list_all(&key).unwrap();
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.status == TxStatus::Confirmed)
                .count(),
            20
        );
        assert_eq!(storage.store.get(&key).await.unwrap().next_nonce, 40);
    }
}
