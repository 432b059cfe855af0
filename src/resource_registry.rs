//! Reference-counted ownership of shared resources
//!
//! Every chain connector mints one [`HandleId`] and declares it against each
//! shared resource it uses. A resource's close routine runs exactly once,
//! when the last declared holder closes it. Closing with an unknown handle,
//! or closing an already-closed resource, is a no-op so partially
//! constructed connectors can always release what they grabbed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};

/// Opaque ownership token, one per connector instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Identifies one shared resource, e.g. `nonce-store:/var/lib/keeper/nonce.db`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(kind: &str, location: impl fmt::Display) -> Self {
        Self(format!("{}:{}", kind, location))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Underlying close routine of a shared resource
#[async_trait]
pub trait Closeable: Send + Sync {
    async fn close(&self) -> NonceResult<()>;
}

struct Slot {
    holders: HashSet<HandleId>,
    closer: Arc<dyn Closeable>,
}

/// Registry mapping resource → holders and resource → close routine
pub struct ResourceRegistry {
    next_handle: AtomicU64,
    slots: Mutex<HashMap<ResourceId, Slot>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh, never reused handle
    pub fn create_handle(&self) -> HandleId {
        HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Install the close routine for a resource.
    ///
    /// Returns `false` if the resource is already registered; the existing
    /// routine is kept.
    pub fn register(&self, resource: ResourceId, closer: Arc<dyn Closeable>) -> bool {
        let mut slots = self.slots.lock();
        if slots.contains_key(&resource) {
            return false;
        }
        debug!(resource = %resource, "Registered shared resource");
        slots.insert(
            resource,
            Slot {
                holders: HashSet::new(),
                closer,
            },
        );
        crate::metrics::metrics().open_resources.inc();
        true
    }

    /// Record that `handle` holds `resource`. Idempotent per handle.
    pub fn declare_ownership(&self, resource: &ResourceId, handle: HandleId) -> NonceResult<()> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(resource).ok_or_else(|| {
            NonceError::ResourceUnavailable(format!("{} is not registered", resource))
        })?;
        if slot.holders.insert(handle) {
            debug!(
                resource = %resource,
                handle = %handle,
                holders = slot.holders.len(),
                "Ownership declared"
            );
        }
        Ok(())
    }

    /// Drop `handle`'s hold on `resource`.
    ///
    /// Returns `Ok(true)` when this call ran the close routine. Unknown
    /// resources and unregistered handles are no-ops.
    pub async fn close(&self, resource: &ResourceId, handle: HandleId) -> NonceResult<bool> {
        let closer = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(resource) else {
                debug!(resource = %resource, handle = %handle, "Close on unknown resource ignored");
                return Ok(false);
            };
            if !slot.holders.remove(&handle) {
                debug!(resource = %resource, handle = %handle, "Close by non-holder ignored");
                return Ok(false);
            }
            if !slot.holders.is_empty() {
                debug!(
                    resource = %resource,
                    handle = %handle,
                    holders = slot.holders.len(),
                    "Ownership released, resource still held"
                );
                return Ok(false);
            }
            // Removing the slot under the lock makes the close routine run once
            slots.remove(resource).map(|slot| slot.closer)
        };

        let Some(closer) = closer else {
            return Ok(false);
        };
        crate::metrics::metrics().open_resources.dec();
        match closer.close().await {
            Ok(()) => {
                info!(resource = %resource, handle = %handle, "Last holder released, resource closed");
                Ok(true)
            }
            Err(err) => {
                warn!(resource = %resource, error = %err, "Close routine failed");
                Err(err)
            }
        }
    }

    /// Number of holders, `None` once the resource is closed or was never registered
    pub fn holders(&self, resource: &ResourceId) -> Option<usize> {
        self.slots.lock().get(resource).map(|slot| slot.holders.len())
    }

    pub fn is_open(&self, resource: &ResourceId) -> bool {
        self.slots.lock().contains_key(resource)
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
