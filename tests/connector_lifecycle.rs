//! Integration test for the connector lifecycle
//!
//! Several chains share one nonce store and one transaction log through the
//! registry. The storage must stay usable until the last connector closes.

#[cfg(test)]
mod connector_lifecycle_tests {
    use alloy_primitives::{Address, B256};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use nonce_keeper::chain::{ConnectorSettings, InitState};
    use nonce_keeper::nonce_manager::{NonceResult, ReconcilerConfig, RetryConfig};
    use nonce_keeper::types::Receipt;
    use nonce_keeper::{ChainDescriptor, ConnectorRegistry, LedgerOracle, NonceError, TxHash};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const WALLET: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";

    /// Node that reports a fixed transaction count per address
    #[derive(Default)]
    struct StaticNode {
        counts: DashMap<Address, u64>,
    }

    #[async_trait]
    impl LedgerOracle for StaticNode {
        async fn get_confirmed_transaction_count(&self, address: &Address) -> NonceResult<u64> {
            Ok(self.counts.get(address).map(|c| *c).unwrap_or(0))
        }

        async fn get_transaction_receipt(&self, _tx_hash: &TxHash) -> NonceResult<Option<Receipt>> {
            Ok(None)
        }

        async fn is_transaction_known(&self, _tx_hash: &TxHash) -> NonceResult<bool> {
            Ok(true)
        }

        fn endpoint(&self) -> &str {
            "static"
        }
    }

    fn node_with_count(count: u64) -> Arc<dyn LedgerOracle> {
        let node = StaticNode::default();
        node.counts.insert(WALLET.parse().unwrap(), count);
        Arc::new(node)
    }

    fn registry(dir: &TempDir) -> ConnectorRegistry {
        let settings = ConnectorSettings {
            nonce_db_path: dir.path().join("evm-nonces"),
            transaction_db_path: dir.path().join("transactions"),
            reconciler: ReconcilerConfig {
                interval: Duration::from_secs(3600),
                retry: RetryConfig::none(),
                ..ReconcilerConfig::default()
            },
        };
        ConnectorRegistry::new(settings, true)
    }

    fn descriptor(name: &str, chain_id: u64) -> ChainDescriptor {
        ChainDescriptor::new(name, "mainnet", chain_id, "http://127.0.0.1:8545")
            .with_addresses([WALLET])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_chains_share_storage_until_last_close() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let base = registry
            .get_or_create(descriptor("base", 8453), node_with_count(7))
            .await
            .unwrap();
        let optimism = registry
            .get_or_create(descriptor("optimism", 10), node_with_count(2))
            .await
            .unwrap();

        base.init().await.unwrap();
        optimism.init().await.unwrap();
        assert_eq!(base.state(), InitState::Ready);

        // Same wallet, independent sequences per chain
        assert_eq!(base.allocate(WALLET).await.unwrap(), 7);
        assert_eq!(optimism.allocate(WALLET).await.unwrap(), 2);

        let (nonce, hash) = base
            .provide_nonce(WALLET, None, |nonce| async move {
                Ok::<_, anyhow::Error>(B256::from(alloy_primitives::U256::from(nonce)))
            })
            .await
            .unwrap();
        assert_eq!(nonce, 8);
        assert_eq!(hash, B256::from(alloy_primitives::U256::from(8u64)));

        assert!(registry.disconnect("base", "mainnet").await.unwrap());
        assert!(base.is_closed());
        assert!(registry.get("base", "mainnet").await.is_none());
        assert!(matches!(
            base.allocate(WALLET).await,
            Err(NonceError::ResourceUnavailable(_))
        ));

        // Storage is still held by the other chain
        assert_eq!(optimism.allocate(WALLET).await.unwrap(), 3);
        assert_eq!(registry.connected_instances().await.len(), 1);

        registry.shutdown_all().await.unwrap();
        assert!(optimism.is_closed());
        assert!(registry.connected_instances().await.is_empty());
        assert!(matches!(
            optimism.allocate(WALLET).await,
            Err(NonceError::ResourceUnavailable(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_survives_registry_restart() {
        let dir = TempDir::new().unwrap();
        {
            let registry = registry(&dir);
            let base = registry
                .get_or_create(descriptor("base", 8453), node_with_count(0))
                .await
                .unwrap();
            for expected in 0..4 {
                assert_eq!(base.allocate(WALLET).await.unwrap(), expected);
            }
            registry.shutdown_all().await.unwrap();
        }

        let registry = registry(&dir);
        let base = registry
            .get_or_create(descriptor("base", 8453), node_with_count(0))
            .await
            .unwrap();
        base.init().await.unwrap();
        // The node lags behind our reservations; local state wins
        assert_eq!(base.list_outstanding(WALLET).unwrap().len(), 4);
        assert_eq!(base.allocate(WALLET).await.unwrap(), 4);
        registry.shutdown_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_while_old_connector_is_still_held() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let old = registry
            .get_or_create(descriptor("base", 8453), node_with_count(0))
            .await
            .unwrap();
        assert_eq!(old.allocate(WALLET).await.unwrap(), 0);
        assert!(registry.disconnect("base", "mainnet").await.unwrap());

        // `old` still points at the closed storage
        let fresh = registry
            .get_or_create(descriptor("base", 8453), node_with_count(0))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(old.is_closed());
        assert_eq!(fresh.allocate(WALLET).await.unwrap(), 1);
        registry.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_or_create_returns_live_connector() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let first = registry
            .get_or_create(descriptor("base", 8453), node_with_count(0))
            .await
            .unwrap();
        let second = registry
            .get_or_create(descriptor("base", 8453), node_with_count(0))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!registry.disconnect("arbitrum", "mainnet").await.unwrap());

        registry.shutdown_all().await.unwrap();
        registry.shutdown_all().await.unwrap();
    }
}
