//! Nonce Manager Module
//!
//! Per-address nonce allocation backed by a durable store, kept honest by a
//! reconciler that compares local state with the remote node.

// Submodules
pub mod nonce_allocator;
pub mod nonce_errors;
pub mod nonce_reclaim;
pub mod nonce_reconciler;
pub mod nonce_retry;
pub mod nonce_store;

// Re-exports for convenience
pub use nonce_allocator::SequenceAllocator;
pub use nonce_errors::{NonceError, NonceResult};
pub use nonce_reclaim::select_reclaimable;
pub use nonce_reconciler::{NonceReconciler, PassReport, ReconcilerConfig, SyncOutcome};
pub use nonce_retry::{retry_with_backoff, with_deadline, RetryConfig};
pub use nonce_store::{AddressGuard, NonceStore};
