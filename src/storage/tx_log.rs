//! Durable transaction log
//!
//! Append/update/query store of nonce reservations keyed by
//! `(chain, address, nonce)`. Entries survive restart; Reserved and
//! Submitted entries are picked up again by the reconciler.
//!
//! A per-address index keeps the highest committed nonce and the current
//! reclaimable nonce, so allocation never scans the history.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, instrument};

use super::backend::SledBackend;
use crate::nonce_manager::nonce_errors::{NonceError, NonceResult};
use crate::resource_registry::Closeable;
use crate::types::{ChainAddress, PendingTransactionEntry, TxHash, TxStatus};

const ENTRIES_TREE: &str = "transactions";
const ARCHIVE_TREE: &str = "transactions_archive";
const INDEX_TREE: &str = "transaction_index";

/// Summary of one address's entries, stored under its storage prefix.
///
/// `highest_committed` may run ahead of the entries after a crash but
/// never behind. `reclaimable` is only a hint; readers check the entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct AddressIndex {
    highest_committed: Option<u64>,
    reclaimable: Option<u64>,
}

impl AddressIndex {
    fn scan(entries: &sled::Tree, key: &ChainAddress) -> NonceResult<Self> {
        let mut index = Self::default();
        for value in entries.scan_prefix(key.storage_prefix()).values() {
            let entry: PendingTransactionEntry = bincode::deserialize(&value?)?;
            if entry.status.is_committed() {
                index.highest_committed = Some(entry.nonce);
            }
            if entry.reclaimable && entry.status == TxStatus::Expired && index.reclaimable.is_none() {
                index.reclaimable = Some(entry.nonce);
            }
        }
        Ok(index)
    }
}

pub struct TransactionLog {
    backend: SledBackend,
    /// Serializes entry and index writes so the two stay in step
    writes: Mutex<()>,
}

impl TransactionLog {
    pub fn open(path: &Path, flush_on_write: bool) -> NonceResult<Self> {
        let backend =
            SledBackend::open(path, flush_on_write, &[ENTRIES_TREE, ARCHIVE_TREE, INDEX_TREE])?;
        Ok(Self {
            backend,
            writes: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        self.backend.path()
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }

    /// Upsert by `(chain, address, nonce)` and flush before returning.
    ///
    /// A terminal entry that gets replaced is copied to the archive first.
    #[instrument(skip(self, entry), fields(key = %entry.key, nonce = entry.nonce, status = %entry.status))]
    pub async fn record(&self, entry: &PendingTransactionEntry) -> NonceResult<()> {
        self.write_entry(&entry.key, entry.nonce, Some(entry), true)?;
        self.backend.persist().await
    }

    /// Forward-only status transition.
    ///
    /// Returns `Ok(false)` without writing when the transition is not
    /// allowed (e.g. the entry is already terminal).
    #[instrument(skip(self, key, tx_hash), fields(key = %key))]
    pub async fn update_status(
        &self,
        key: &ChainAddress,
        nonce: u64,
        status: TxStatus,
        tx_hash: Option<TxHash>,
    ) -> NonceResult<bool> {
        let mut entry = self.get(key, nonce)?.ok_or_else(|| NonceError::UnknownEntry {
            key: key.to_string(),
            nonce,
        })?;
        if !entry.status.can_transition_to(status) {
            debug!(from = %entry.status, to = %status, "Ignoring backward transition");
            return Ok(false);
        }
        let now = Utc::now();
        entry.status = status;
        if tx_hash.is_some() {
            entry.transaction_hash = tx_hash;
        }
        if status == TxStatus::Submitted {
            entry.submitted_at = Some(now);
        }
        entry.last_checked_at = now;
        entry.reclaimable = false;
        self.write_entry(key, nonce, Some(&entry), false)?;
        self.backend.persist().await?;
        debug!(status = %status, "Entry transitioned");
        Ok(true)
    }

    /// Stamp `last_checked_at` on an entry the reconciler looked at
    pub async fn touch_checked(&self, key: &ChainAddress, nonce: u64) -> NonceResult<()> {
        if let Some(mut entry) = self.get(key, nonce)? {
            entry.last_checked_at = Utc::now();
            self.write_entry(key, nonce, Some(&entry), false)?;
            self.backend.persist().await?;
        }
        Ok(())
    }

    /// Flag exactly `nonce` (or nothing) as reclaimable for this address.
    ///
    /// Only an Expired entry can carry the flag.
    pub async fn set_reclaimable(&self, key: &ChainAddress, nonce: Option<u64>) -> NonceResult<()> {
        let current = self.index(key)?.reclaimable;
        let mut changed = false;
        if let Some(previous) = current.filter(|&n| Some(n) != nonce) {
            changed |= self.flag_reclaimable(key, previous, false)?;
        }
        if let Some(nonce) = nonce {
            changed |= self.flag_reclaimable(key, nonce, true)?;
        }
        if changed {
            self.backend.persist().await?;
        }
        Ok(())
    }

    fn flag_reclaimable(&self, key: &ChainAddress, nonce: u64, flag: bool) -> NonceResult<bool> {
        let Some(mut entry) = self.get(key, nonce)? else {
            return Ok(false);
        };
        let want = flag && entry.status == TxStatus::Expired;
        if entry.reclaimable == want {
            return Ok(false);
        }
        entry.reclaimable = want;
        self.write_entry(key, nonce, Some(&entry), false)?;
        Ok(true)
    }

    /// Delete an entry. Only used to roll back a reservation that could not be completed.
    pub(crate) async fn remove(&self, key: &ChainAddress, nonce: u64) -> NonceResult<()> {
        self.write_entry(key, nonce, None, false)?;
        self.backend.persist().await
    }

    /// Write (or delete, with `next = None`) one entry and its index.
    ///
    /// A rising `highest_committed` lands in the index before the entry;
    /// a falling one is rebuilt from the entries after the write.
    fn write_entry(
        &self,
        key: &ChainAddress,
        nonce: u64,
        next: Option<&PendingTransactionEntry>,
        archive_superseded: bool,
    ) -> NonceResult<()> {
        let _serial = self.writes.lock();
        let entries = self.backend.tree(ENTRIES_TREE)?;
        let index_tree = self.backend.tree(INDEX_TREE)?;
        let entry_key = key.entry_key(nonce);

        let previous: Option<PendingTransactionEntry> = match entries.get(&entry_key)? {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        };
        if let (true, Some(previous), Some(next)) = (archive_superseded, &previous, next) {
            if previous.status.is_terminal() && previous != next {
                let mut archive_key = entry_key.clone();
                archive_key.extend_from_slice(&self.backend.generate_id()?.to_be_bytes());
                self.backend
                    .tree(ARCHIVE_TREE)?
                    .insert(archive_key, bincode::serialize(previous)?)?;
                debug!(previous = %previous.status, "Archived superseded entry");
            }
        }

        let mut index = Self::load_index(&entries, &index_tree, key)?;
        let was_committed = previous.as_ref().is_some_and(|e| e.status.is_committed());
        let now_committed = next.is_some_and(|e| e.status.is_committed());
        let rescan = was_committed && !now_committed && index.highest_committed == Some(nonce);
        if now_committed && index.highest_committed.map_or(true, |highest| nonce > highest) {
            index.highest_committed = Some(nonce);
        }
        match next {
            Some(e) if e.reclaimable && e.status == TxStatus::Expired => {
                index.reclaimable = Some(nonce)
            }
            _ if index.reclaimable == Some(nonce) => index.reclaimable = None,
            _ => {}
        }

        let write = |entries: &sled::Tree| -> NonceResult<()> {
            match next {
                Some(next) => {
                    entries.insert(&entry_key, bincode::serialize(next)?)?;
                }
                None => {
                    entries.remove(&entry_key)?;
                }
            }
            Ok(())
        };
        if rescan {
            write(&entries)?;
            index = AddressIndex::scan(&entries, key)?;
            index_tree.insert(key.storage_prefix(), bincode::serialize(&index)?)?;
        } else {
            index_tree.insert(key.storage_prefix(), bincode::serialize(&index)?)?;
            write(&entries)?;
        }
        Ok(())
    }

    fn load_index(
        entries: &sled::Tree,
        index_tree: &sled::Tree,
        key: &ChainAddress,
    ) -> NonceResult<AddressIndex> {
        match index_tree.get(key.storage_prefix())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => AddressIndex::scan(entries, key),
        }
    }

    fn index(&self, key: &ChainAddress) -> NonceResult<AddressIndex> {
        Self::load_index(
            &self.backend.tree(ENTRIES_TREE)?,
            &self.backend.tree(INDEX_TREE)?,
            key,
        )
    }

    pub fn get(&self, key: &ChainAddress, nonce: u64) -> NonceResult<Option<PendingTransactionEntry>> {
        match self.backend.tree(ENTRIES_TREE)?.get(key.entry_key(nonce))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every entry for the address, ascending by nonce
    pub fn list_all(&self, key: &ChainAddress) -> NonceResult<Vec<PendingTransactionEntry>> {
        self.backend
            .tree(ENTRIES_TREE)?
            .scan_prefix(key.storage_prefix())
            .values()
            .map(|value| -> NonceResult<PendingTransactionEntry> { Ok(bincode::deserialize(&value?)?) })
            .collect()
    }

    /// Reserved and Submitted entries, ascending by nonce
    pub fn list_outstanding(&self, key: &ChainAddress) -> NonceResult<Vec<PendingTransactionEntry>> {
        Ok(self
            .list_all(key)?
            .into_iter()
            .filter(|e| e.status.is_outstanding())
            .collect())
    }

    /// Highest nonce that was broadcast (Submitted or Confirmed)
    pub fn highest_committed(&self, key: &ChainAddress) -> NonceResult<Option<u64>> {
        Ok(self.index(key)?.highest_committed)
    }

    /// The Expired entry flagged for reissue, if any
    pub fn reclaimable_entry(&self, key: &ChainAddress) -> NonceResult<Option<PendingTransactionEntry>> {
        let Some(nonce) = self.index(key)?.reclaimable else {
            return Ok(None);
        };
        Ok(self
            .get(key, nonce)?
            .filter(|e| e.reclaimable && e.status == TxStatus::Expired))
    }

    /// Entries superseded at this nonce, oldest first
    pub fn history(&self, key: &ChainAddress, nonce: u64) -> NonceResult<Vec<PendingTransactionEntry>> {
        self.backend
            .tree(ARCHIVE_TREE)?
            .scan_prefix(key.entry_key(nonce))
            .values()
            .map(|value| -> NonceResult<PendingTransactionEntry> { Ok(bincode::deserialize(&value?)?) })
            .collect()
    }
}

#[async_trait]
impl Closeable for TransactionLog {
    async fn close(&self) -> NonceResult<()> {
        self.backend.drain_and_close().await.map(|_| ())
    }
}
