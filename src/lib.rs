//! Nonce Keeper Library
//!
//! Nonce allocation for EVM wallets shared by many concurrent callers,
//! reconciled against the remote node and backed by storage that survives
//! restarts. Shared stores are opened once per path and closed when the
//! last chain connector holding them lets go.

pub mod chain;
pub mod config;
pub mod endpoints;
pub mod metrics;
pub mod nonce_manager;
pub mod resource_registry;
pub mod storage;
pub mod test_utils;
pub mod types;

// Re-export commonly used types
pub use chain::{ChainConnector, ChainDescriptor, ConnectorRegistry, LedgerOracle};
pub use nonce_manager::{NonceError, NonceResult, SequenceAllocator};
pub use types::{ChainAddress, PendingTransactionEntry, TxHash, TxStatus};

#[cfg(test)]
mod tests {
    // Include test modules
    mod nonce_concurrency_tests;
    mod nonce_property_tests;
    mod nonce_restart_tests;
    mod nonce_scenario_tests;
}
