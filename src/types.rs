//! Core data model shared by the nonce store, transaction log and reconciler

use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};

/// Transaction hash as reported by the node
pub type TxHash = B256;

/// Composite key: one nonce record and one pending set per value.
///
/// The address is stored as raw bytes and always rendered in EIP-55
/// checksummed form, so `0xabc..` and `0xABC..` resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainAddress {
    chain: String,
    address: Address,
}

impl ChainAddress {
    /// Parse and normalize a (chain, address) pair
    pub fn new(chain: &str, address: &str) -> NonceResult<Self> {
        let address = Address::from_str(address.trim())
            .map_err(|e| NonceError::InvalidAddress(format!("{}: {}", address, e)))?;
        Self::from_parts(chain, address)
    }

    pub fn from_parts(chain: &str, address: Address) -> NonceResult<Self> {
        if chain.is_empty() || chain.contains('\0') {
            return Err(NonceError::Configuration(format!(
                "invalid chain identifier {:?}",
                chain
            )));
        }
        Ok(Self {
            chain: chain.to_string(),
            address,
        })
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// EIP-55 checksummed address
    pub fn checksummed(&self) -> String {
        self.address.to_checksum(None)
    }

    /// Storage key: `chain \0 address[20]`.
    ///
    /// Transaction entries append the big-endian nonce to this prefix, so a
    /// prefix scan yields entries in ascending nonce order.
    pub(crate) fn storage_prefix(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.chain.len() + 1 + 20 + 8);
        key.extend_from_slice(self.chain.as_bytes());
        key.push(0);
        key.extend_from_slice(self.address.as_slice());
        key
    }

    pub(crate) fn entry_key(&self, nonce: u64) -> Vec<u8> {
        let mut key = self.storage_prefix();
        key.extend_from_slice(&nonce.to_be_bytes());
        key
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.checksummed())
    }
}

/// Next nonce to hand out for one ChainAddress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub key: ChainAddress,
    pub next_nonce: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl NonceRecord {
    pub fn new(key: ChainAddress) -> Self {
        Self {
            key,
            next_nonce: 0,
            last_synced_at: None,
        }
    }
}

/// Lifecycle of a single nonce reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Reserved,
    Submitted,
    Confirmed,
    Failed,
    Expired,
}

impl TxStatus {
    /// Reserved and Submitted entries hold their nonce
    pub fn is_outstanding(self) -> bool {
        matches!(self, TxStatus::Reserved | TxStatus::Submitted)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_outstanding()
    }

    /// Submitted and Confirmed nonces have been broadcast and can never be reissued
    pub fn is_committed(self) -> bool {
        matches!(self, TxStatus::Submitted | TxStatus::Confirmed)
    }

    /// Forward-only transition table
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Reserved, Submitted)
                | (Reserved, Expired)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
                | (Submitted, Expired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Reserved => "reserved",
            TxStatus::Submitted => "submitted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reserved nonce and what became of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransactionEntry {
    pub key: ChainAddress,
    pub nonce: u64,
    pub transaction_hash: Option<TxHash>,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    /// When the entry moved to Submitted; the drop window runs from here
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_checked_at: DateTime<Utc>,
    /// Set by the reconciler on the single expired nonce that may be handed out again
    pub reclaimable: bool,
}

impl PendingTransactionEntry {
    pub fn reserved(key: ChainAddress, nonce: u64) -> Self {
        let now = Utc::now();
        Self {
            key,
            nonce,
            transaction_hash: None,
            status: TxStatus::Reserved,
            created_at: now,
            submitted_at: None,
            last_checked_at: now,
            reclaimable: false,
        }
    }
}

/// Subset of a transaction receipt the reconciler needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub block_number: u64,
    /// `false` for a reverted transaction; the nonce is still consumed
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOWER: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";
    const CHECKSUMMED: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn test_chain_address_normalizes_case() {
        let a = ChainAddress::new("base", LOWER).unwrap();
        let b = ChainAddress::new("base", CHECKSUMMED).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.checksummed(), CHECKSUMMED);
        assert_eq!(a.to_string(), format!("base:{}", CHECKSUMMED));
    }

    #[test]
    fn test_chain_address_rejects_garbage() {
        assert!(matches!(
            ChainAddress::new("base", "0x1234"),
            Err(NonceError::InvalidAddress(_))
        ));
        assert!(matches!(
            ChainAddress::new("", LOWER),
            Err(NonceError::Configuration(_))
        ));
    }

    #[test]
    fn test_entry_keys_sort_by_nonce() {
        let key = ChainAddress::new("base", LOWER).unwrap();
        let k1 = key.entry_key(1);
        let k256 = key.entry_key(256);
        assert!(k1 < k256);
        assert!(k1.starts_with(&key.storage_prefix()));
    }

    #[test]
    fn test_status_transitions_only_move_forward() {
        use TxStatus::*;
        assert!(Reserved.can_transition_to(Submitted));
        assert!(Reserved.can_transition_to(Expired));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Submitted.can_transition_to(Failed));
        assert!(!Reserved.can_transition_to(Confirmed));
        for terminal in [Confirmed, Failed, Expired] {
            for next in [Reserved, Submitted, Confirmed, Failed, Expired] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
