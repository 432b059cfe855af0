//! Reclaim policy for expired reservations
//!
//! EVM nodes confirm an address's transactions strictly in nonce order, so
//! an abandoned nonce blocks every higher one until something is mined at
//! that nonce. Only the lowest expired nonce the chain has not yet passed
//! is ever made reusable; anything above it stays parked until the gap is
//! filled.

use super::nonce_errors::{NonceError, NonceResult};
use crate::types::{ChainAddress, PendingTransactionEntry, TxStatus};

/// Pick the single expired nonce that may be handed out again.
///
/// * `next_nonce` - local next nonce; only nonces below it were ever issued
/// * `remote_count` - confirmed transaction count reported by the node, if known
///
/// Fails with `ReconciliationConflict` when a nonce above the gap is
/// confirmed locally while the node claims it has not reached the gap yet.
pub fn select_reclaimable(
    key: &ChainAddress,
    entries: &[PendingTransactionEntry],
    next_nonce: u64,
    remote_count: Option<u64>,
) -> NonceResult<Option<u64>> {
    let floor = remote_count.unwrap_or(0);
    let Some(gap) = entries
        .iter()
        .filter(|e| e.status == TxStatus::Expired)
        .map(|e| e.nonce)
        .filter(|n| *n < next_nonce && *n >= floor)
        .min()
    else {
        return Ok(None);
    };

    let confirmed_above = entries
        .iter()
        .filter(|e| e.status == TxStatus::Confirmed && e.nonce > gap)
        .map(|e| e.nonce)
        .max();

    match (confirmed_above, remote_count) {
        (None, _) => Ok(Some(gap)),
        (Some(confirmed), Some(remote)) => Err(NonceError::ReconciliationConflict {
            key: key.to_string(),
            detail: format!(
                "nonce {} confirmed above expired nonce {} but node reports count {}",
                confirmed, gap, remote
            ),
        }),
        // Without the node's view the gap was most likely filled elsewhere
        (Some(_), None) => Ok(None),
    }
}
