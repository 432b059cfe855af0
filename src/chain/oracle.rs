//! Remote ledger oracle
//!
//! The node is treated as an unreliable source of two facts: the confirmed
//! transaction count of an address and the receipt of a transaction. Calls
//! may fail, lag behind, or never return; callers wrap them in deadlines.

use alloy_primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};
use crate::types::{Receipt, TxHash};

#[async_trait]
pub trait LedgerOracle: Send + Sync {
    /// Number of transactions from `address` included in the latest block
    async fn get_confirmed_transaction_count(&self, address: &Address) -> NonceResult<u64>;

    /// Receipt of a mined transaction, `None` while pending or unknown
    async fn get_transaction_receipt(&self, tx_hash: &TxHash) -> NonceResult<Option<Receipt>>;

    /// Whether the node knows the transaction at all (mempool or chain)
    async fn is_transaction_known(&self, tx_hash: &TxHash) -> NonceResult<bool>;

    /// Endpoint label for logs
    fn endpoint(&self) -> &str;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    block_number: Option<String>,
    status: Option<String>,
}

fn parse_quantity(raw: &str) -> NonceResult<u64> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|e| NonceError::oracle(None, format!("bad quantity {:?}: {}", raw, e)))
}

/// Minimal Ethereum JSON-RPC client
pub struct JsonRpcOracle {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcOracle {
    pub fn new(url: &str, request_timeout: Duration) -> NonceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NonceError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> NonceResult<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let timer = crate::metrics::Timer::new();
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| NonceError::oracle(Some(&self.url), e.to_string()))?;
        let body: RpcResponse = response
            .error_for_status()
            .map_err(|e| NonceError::oracle(Some(&self.url), e.to_string()))?
            .json()
            .await
            .map_err(|e| NonceError::oracle(Some(&self.url), e.to_string()))?;
        timer.observe_duration(&crate::metrics::metrics().oracle_latency);
        trace!(method, latency_ms = timer.elapsed_ms(), "RPC call completed");

        if let Some(err) = body.error {
            return Err(NonceError::oracle(
                Some(&self.url),
                format!("{} ({})", err.message, err.code),
            ));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl LedgerOracle for JsonRpcOracle {
    async fn get_confirmed_transaction_count(&self, address: &Address) -> NonceResult<u64> {
        let result = self
            .call("eth_getTransactionCount", json!([address, "latest"]))
            .await?;
        match result.as_str() {
            Some(raw) => parse_quantity(raw),
            None => Err(NonceError::oracle(
                Some(&self.url),
                format!("unexpected transaction count {}", result),
            )),
        }
    }

    async fn get_transaction_receipt(&self, tx_hash: &TxHash) -> NonceResult<Option<Receipt>> {
        let result = self.call("eth_getTransactionReceipt", json!([tx_hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        let raw: RawReceipt = serde_json::from_value(result)
            .map_err(|e| NonceError::oracle(Some(&self.url), e.to_string()))?;
        let Some(block) = raw.block_number.as_deref() else {
            return Ok(None);
        };
        Ok(Some(Receipt {
            transaction_hash: raw.transaction_hash,
            block_number: parse_quantity(block)?,
            // Pre-Byzantium receipts carry no status field
            success: raw.status.as_deref().map_or(true, |s| parse_quantity(s) == Ok(1)),
        }))
    }

    async fn is_transaction_known(&self, tx_hash: &TxHash) -> NonceResult<bool> {
        let result = self.call("eth_getTransactionByHash", json!([tx_hash])).await?;
        Ok(!result.is_null())
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Caches mined receipts in front of another oracle.
///
/// Only receipts are cached; counts and "not found yet" answers always go
/// to the node. Expired receipts are dropped whenever a new one is cached.
pub struct CachingOracle {
    inner: Arc<dyn LedgerOracle>,
    receipts: DashMap<TxHash, (Receipt, Instant)>,
    ttl: Duration,
}

impl CachingOracle {
    pub fn new(inner: Arc<dyn LedgerOracle>, ttl: Duration) -> Self {
        Self {
            inner,
            receipts: DashMap::new(),
            ttl,
        }
    }

    pub fn cached_receipts(&self) -> usize {
        self.receipts.len()
    }
}

#[async_trait]
impl LedgerOracle for CachingOracle {
    async fn get_confirmed_transaction_count(&self, address: &Address) -> NonceResult<u64> {
        self.inner.get_confirmed_transaction_count(address).await
    }

    async fn get_transaction_receipt(&self, tx_hash: &TxHash) -> NonceResult<Option<Receipt>> {
        if let Some(cached) = self.receipts.get(tx_hash) {
            if cached.1.elapsed() < self.ttl {
                return Ok(Some(cached.0.clone()));
            }
        }
        self.receipts.remove(tx_hash);

        let receipt = self.inner.get_transaction_receipt(tx_hash).await?;
        if let Some(receipt) = &receipt {
            debug!(tx_hash = %tx_hash, block = receipt.block_number, "Caching receipt");
            let ttl = self.ttl;
            self.receipts.retain(|_, (_, cached_at)| cached_at.elapsed() < ttl);
            self.receipts
                .insert(*tx_hash, (receipt.clone(), Instant::now()));
        }
        Ok(receipt)
    }

    async fn is_transaction_known(&self, tx_hash: &TxHash) -> NonceResult<bool> {
        if self.receipts.contains_key(tx_hash) {
            return Ok(true);
        }
        self.inner.is_transaction_known(tx_hash).await
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockOracle;
    use alloy_primitives::B256;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_raw_receipt_decoding() {
        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": format!("0x{}", "ab".repeat(32)),
            "blockNumber": "0x10",
            "status": "0x0",
            "gasUsed": "0x5208"
        }))
        .unwrap();
        assert_eq!(raw.transaction_hash, B256::repeat_byte(0xab));
        assert_eq!(raw.block_number.as_deref(), Some("0x10"));
        assert_eq!(raw.status.as_deref(), Some("0x0"));
    }

    #[tokio::test]
    async fn test_caching_oracle_caches_only_mined_receipts() {
        let mock = Arc::new(MockOracle::new());
        let hash = B256::repeat_byte(1);
        let oracle = CachingOracle::new(mock.clone(), Duration::from_secs(3600));

        assert!(oracle.get_transaction_receipt(&hash).await.unwrap().is_none());
        assert_eq!(oracle.cached_receipts(), 0);

        mock.set_receipt(hash, 12, true);
        assert!(oracle.get_transaction_receipt(&hash).await.unwrap().is_some());
        assert_eq!(oracle.cached_receipts(), 1);

        let calls = mock.receipt_calls();
        assert!(oracle.get_transaction_receipt(&hash).await.unwrap().is_some());
        assert_eq!(mock.receipt_calls(), calls);
    }

    #[tokio::test]
    async fn test_caching_oracle_evicts_expired_receipts() {
        let mock = Arc::new(MockOracle::new());
        let oracle = CachingOracle::new(mock.clone(), Duration::from_millis(20));
        let (a, b) = (B256::repeat_byte(1), B256::repeat_byte(2));
        mock.set_receipt(a, 1, true);
        mock.set_receipt(b, 2, true);

        oracle.get_transaction_receipt(&a).await.unwrap();
        assert_eq!(oracle.cached_receipts(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;

        // `a` is never asked for again but must not linger
        oracle.get_transaction_receipt(&b).await.unwrap();
        assert_eq!(oracle.cached_receipts(), 1);
    }
}
