//! Nonce reconciliation against the remote node
//!
//! Remote reads always happen outside the per-address section. Their
//! results are applied under the section after local state has been read
//! again, since the remote value may already be stale by then.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::nonce_errors::{NonceError, NonceResult};
use super::nonce_reclaim::select_reclaimable;
use super::nonce_retry::{retry_with_backoff, with_deadline, RetryConfig};
use super::nonce_store::NonceStore;
use crate::chain::oracle::LedgerOracle;
use crate::metrics::metrics;
use crate::storage::TransactionLog;
use crate::types::{ChainAddress, PendingTransactionEntry, Receipt, TxHash, TxStatus};

/// Reconciler timing
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between scheduled passes
    pub interval: Duration,
    /// Submitted entries not looked at for this long get a receipt lookup
    pub staleness_window: Duration,
    /// Reserved entries older than this are expired
    pub reservation_timeout: Duration,
    /// Submitted entries the node has never heard of are expired after this long
    pub drop_window: Duration,
    /// Deadline for a single oracle call
    pub oracle_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            staleness_window: Duration::from_secs(30),
            reservation_timeout: Duration::from_secs(120),
            drop_window: Duration::from_secs(600),
            oracle_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

/// What a startup sync did to the local next nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local and remote agree
    InSync { next_nonce: u64 },
    /// Remote was ahead; local jumped forward
    Adopted { from: u64, to: u64, expired: usize },
    /// Outstanding entries at or above local next were found (crash between
    /// reserving and persisting the increment)
    Recovered { from: u64, to: u64 },
    /// Remote is below local with nothing in flight to explain it
    RemoteBehind { local: u64, remote: u64 },
    /// Remote is below local because our own transactions are still in flight
    Pending {
        next_nonce: u64,
        remote: u64,
        outstanding: usize,
    },
}

/// Summary of one reconciliation pass over one address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub sync: Option<SyncOutcome>,
    /// Submitted entries that got an oracle lookup
    pub checked: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub expired: usize,
    /// Lookups that timed out or errored; the entries were left as they were
    pub unresolved: usize,
    pub reclaimable: Option<u64>,
}

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

pub struct NonceReconciler {
    store: Arc<NonceStore>,
    log: Arc<TransactionLog>,
    oracle: Arc<dyn LedgerOracle>,
    config: ReconcilerConfig,
    tracked: DashSet<ChainAddress>,
}

impl NonceReconciler {
    pub fn new(
        store: Arc<NonceStore>,
        log: Arc<TransactionLog>,
        oracle: Arc<dyn LedgerOracle>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            log,
            oracle,
            config,
            tracked: DashSet::new(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Include `key` in scheduled passes; returns false if already tracked
    pub fn track(&self, key: ChainAddress) -> bool {
        self.tracked.insert(key)
    }

    pub fn untrack(&self, key: &ChainAddress) -> bool {
        self.tracked.remove(key).is_some()
    }

    /// Tracked addresses in key order
    pub fn tracked(&self) -> Vec<ChainAddress> {
        let mut keys: Vec<ChainAddress> = self.tracked.iter().map(|k| k.clone()).collect();
        keys.sort();
        keys
    }

    async fn fetch_count(&self, key: &ChainAddress) -> NonceResult<u64> {
        let oracle = self.oracle.clone();
        let address = *key.address();
        let deadline = self.config.oracle_timeout;
        retry_with_backoff("get_confirmed_transaction_count", &self.config.retry, || {
            let oracle = oracle.clone();
            async move {
                with_deadline(deadline, oracle.get_confirmed_transaction_count(&address)).await
            }
        })
        .await
    }

    async fn fetch_receipt(&self, tx_hash: TxHash) -> NonceResult<Option<Receipt>> {
        let oracle = self.oracle.clone();
        let deadline = self.config.oracle_timeout;
        retry_with_backoff("get_transaction_receipt", &self.config.retry, || {
            let oracle = oracle.clone();
            async move { with_deadline(deadline, oracle.get_transaction_receipt(&tx_hash)).await }
        })
        .await
    }

    async fn fetch_known(&self, tx_hash: TxHash) -> NonceResult<bool> {
        let oracle = self.oracle.clone();
        let deadline = self.config.oracle_timeout;
        retry_with_backoff("is_transaction_known", &self.config.retry, || {
            let oracle = oracle.clone();
            async move { with_deadline(deadline, oracle.is_transaction_known(&tx_hash)).await }
        })
        .await
    }

    /// Compare local state with the node's confirmed count and fix it up.
    ///
    /// A timeout or oracle failure changes nothing and is returned as is.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn sync_address(&self, key: &ChainAddress) -> NonceResult<SyncOutcome> {
        let remote = self.fetch_count(key).await?;
        self.apply_remote_count(key, remote).await
    }

    async fn apply_remote_count(&self, key: &ChainAddress, remote: u64) -> NonceResult<SyncOutcome> {
        let _guard = self.store.lock(key).await?;
        let local = self.store.get(key).await?.next_nonce;

        // A reservation below the confirmed count lost its nonce to someone else
        let mut expired = 0;
        for entry in self.log.list_outstanding(key)? {
            if entry.status == TxStatus::Reserved
                && entry.nonce < remote
                && self
                    .log
                    .update_status(key, entry.nonce, TxStatus::Expired, None)
                    .await?
            {
                expired += 1;
            }
        }
        if expired > 0 {
            metrics().reconcile_expired.inc_by(expired as u64);
            debug!(expired, remote, "Expired reservations consumed externally");
        }

        let outstanding = self.log.list_outstanding(key)?;
        let recovered = outstanding
            .iter()
            .map(|e| e.nonce.saturating_add(1))
            .max()
            .filter(|n| *n > local);
        let target = recovered.unwrap_or(local).max(remote);

        let outcome = if target > local {
            self.store.set_next(key, target, &self.log).await?;
            if target == remote {
                metrics().reconcile_adoptions.inc();
                info!(from = local, to = remote, expired, "Adopted remote transaction count");
                SyncOutcome::Adopted {
                    from: local,
                    to: remote,
                    expired,
                }
            } else {
                warn!(from = local, to = target, "Recovered next nonce from outstanding entries");
                SyncOutcome::Recovered {
                    from: local,
                    to: target,
                }
            }
        } else {
            self.store.touch_synced(key).await?;
            if remote == local {
                SyncOutcome::InSync { next_nonce: local }
            } else if outstanding.iter().any(|e| e.nonce >= remote) {
                SyncOutcome::Pending {
                    next_nonce: local,
                    remote,
                    outstanding: outstanding.len(),
                }
            } else {
                metrics().reconcile_remote_behind.inc();
                warn!(
                    local,
                    remote, "Remote node is behind local state, keeping local next nonce"
                );
                SyncOutcome::RemoteBehind { local, remote }
            }
        };
        Ok(outcome)
    }

    /// Move one entry from `from` to `to` under the address section,
    /// re-checking that nobody moved it first
    async fn transition(
        &self,
        key: &ChainAddress,
        nonce: u64,
        from: TxStatus,
        to: TxStatus,
    ) -> NonceResult<bool> {
        let _guard = self.store.lock(key).await?;
        match self.log.get(key, nonce)? {
            Some(entry) if entry.status == from => {
                let moved = self.log.update_status(key, nonce, to, None).await?;
                if moved && to == TxStatus::Expired {
                    metrics().reconcile_expired.inc();
                }
                Ok(moved)
            }
            _ => Ok(false),
        }
    }

    async fn check_submitted(
        &self,
        key: &ChainAddress,
        entry: &PendingTransactionEntry,
        now: DateTime<Utc>,
    ) -> NonceResult<Option<TxStatus>> {
        let receipt = match entry.transaction_hash {
            Some(tx_hash) => self.fetch_receipt(tx_hash).await?,
            None => None,
        };

        if let Some(receipt) = receipt {
            let status = if receipt.success {
                TxStatus::Confirmed
            } else {
                TxStatus::Failed
            };
            if self
                .transition(key, entry.nonce, TxStatus::Submitted, status)
                .await?
            {
                info!(
                    nonce = entry.nonce,
                    block = receipt.block_number,
                    status = %status,
                    "Transaction settled"
                );
                return Ok(Some(status));
            }
            return Ok(None);
        }

        let known = match entry.transaction_hash {
            Some(tx_hash) => self.fetch_known(tx_hash).await?,
            None => false,
        };
        let submitted_at = entry.submitted_at.unwrap_or(entry.created_at);
        if !known && age(submitted_at, now) >= self.config.drop_window {
            if self
                .transition(key, entry.nonce, TxStatus::Submitted, TxStatus::Expired)
                .await?
            {
                warn!(nonce = entry.nonce, "Submitted transaction dropped by the node");
                return Ok(Some(TxStatus::Expired));
            }
            return Ok(None);
        }

        let _guard = self.store.lock(key).await?;
        self.log.touch_checked(key, entry.nonce).await?;
        Ok(None)
    }

    /// Settle stale Submitted entries and expire abandoned reservations
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn reconcile_pending(&self, key: &ChainAddress) -> NonceResult<PassReport> {
        let mut report = PassReport::default();
        let now = Utc::now();

        for entry in self.log.list_outstanding(key)? {
            match entry.status {
                TxStatus::Reserved => {
                    if age(entry.created_at, now) >= self.config.reservation_timeout
                        && self
                            .transition(key, entry.nonce, TxStatus::Reserved, TxStatus::Expired)
                            .await?
                    {
                        debug!(nonce = entry.nonce, "Reservation timed out");
                        report.expired += 1;
                    }
                }
                TxStatus::Submitted => {
                    if age(entry.last_checked_at, now) < self.config.staleness_window {
                        continue;
                    }
                    report.checked += 1;
                    match self.check_submitted(key, &entry, now).await {
                        Ok(Some(TxStatus::Confirmed)) => report.confirmed += 1,
                        Ok(Some(TxStatus::Failed)) => report.failed += 1,
                        Ok(Some(TxStatus::Expired)) => report.expired += 1,
                        Ok(_) => {}
                        Err(err @ (NonceError::Timeout(_) | NonceError::Oracle { .. })) => {
                            report.unresolved += 1;
                            debug!(nonce = entry.nonce, error = %err, "Receipt lookup unresolved, entry left as is");
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ => {}
            }
        }
        Ok(report)
    }

    /// Mark the one expired nonce that may be handed out again, given the
    /// node's confirmed count
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn reclaim(&self, key: &ChainAddress, remote_count: u64) -> NonceResult<Option<u64>> {
        let _guard = self.store.lock(key).await?;
        let next_nonce = self.store.get(key).await?.next_nonce;
        let entries = self.log.list_all(key)?;

        match select_reclaimable(key, &entries, next_nonce, Some(remote_count)) {
            Ok(selected) => {
                self.log.set_reclaimable(key, selected).await?;
                if let Some(nonce) = selected {
                    info!(nonce, "Expired nonce eligible for reuse");
                }
                Ok(selected)
            }
            Err(err) => {
                metrics().reconcile_conflicts.inc();
                self.log.set_reclaimable(key, None).await?;
                error!(error = %err, "Reclaim blocked by conflicting state");
                Err(err)
            }
        }
    }

    /// Full pass: sync, settle pending entries, reclaim.
    ///
    /// Without a remote count (timeout, node down) neither adoption nor
    /// reclaim happens; only receipts are checked.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn run_pass(&self, key: &ChainAddress) -> NonceResult<PassReport> {
        metrics().reconcile_runs.inc();

        let remote = match self.fetch_count(key).await {
            Ok(count) => Some(count),
            Err(err @ (NonceError::Timeout(_) | NonceError::Oracle { .. })) => {
                warn!(error = %err, "Remote count unavailable, skipping adoption and reclaim");
                None
            }
            Err(err) => return Err(err),
        };

        let sync = match remote {
            Some(count) => Some(self.apply_remote_count(key, count).await?),
            None => None,
        };
        let mut report = self.reconcile_pending(key).await?;
        report.sync = sync;
        if let Some(count) = remote {
            report.reclaimable = self.reclaim(key, count).await?;
        }
        Ok(report)
    }

    /// One pass over every tracked address; returns how many failed
    pub async fn run_all(&self) -> usize {
        let mut failures = 0;
        for key in self.tracked() {
            match self.run_pass(&key).await {
                Ok(report) => debug!(key = %key, ?report, "Reconcile pass completed"),
                Err(err) => {
                    failures += 1;
                    metrics().reconcile_failures.inc();
                    if matches!(err, NonceError::ReconciliationConflict { .. }) {
                        error!(key = %key, error = %err, "Reconcile pass needs operator attention");
                    } else {
                        warn!(key = %key, error = %err, "Reconcile pass failed, retrying next tick");
                    }
                }
            }
        }
        failures
    }

    /// Run [`run_all`](Self::run_all) every `interval` until `shutdown` flips to true.
    ///
    /// A pass that is already running finishes before the task exits.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; startup sync already covered it
            ticker.tick().await;
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                addresses = self.tracked.len(),
                "Reconciler started"
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let failures = self.run_all().await;
                        if failures > 0 {
                            debug!(failures, "Reconcile round finished with failures");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Reconciler stopped");
        })
    }
}
