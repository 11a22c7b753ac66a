//! Reconciles pending ledger entries against the network

use super::pending::{AccountRef, PendingLedger};
use super::scheduler::Scheduler;
use super::{PendingTransaction, ReceiptSummary, TxStatus};
use crate::chain::batch::run_bounded;
use crate::chain::{BlockTag, ConnectionManager};
use crate::error::WalletResult;
use crate::metrics;

use chrono::{DateTime, Utc};
use ethers::types::H256;
use futures::FutureExt;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub checked: usize,
    pub mined: usize,
    pub failed: usize,
    pub dropped: usize,
    pub replaced: usize,
    pub still_pending: usize,
    pub pruned: usize,
}

impl TickReport {
    fn merge(&mut self, other: &TickReport) {
        self.checked += other.checked;
        self.mined += other.mined;
        self.failed += other.failed;
        self.dropped += other.dropped;
        self.replaced += other.replaced;
    }
}

enum Outcome {
    Receipt(ReceiptSummary),
    /// No receipt, and the account's confirmed nonce is past this entry
    NonceConsumed,
    Unchanged,
}

pub struct Poller {
    ledger: Arc<PendingLedger>,
    connections: Arc<ConnectionManager>,
    scheduler: Arc<dyn Scheduler>,
    /// Bumped on every arm; a tick only disarms if no arm happened since it started
    arm_generation: Mutex<u64>,
    poll_interval: Duration,
    dropped_timeout: chrono::Duration,
    batch_size: usize,
    batch_delay: Duration,
}

impl Poller {
    pub fn new(
        ledger: Arc<PendingLedger>,
        connections: Arc<ConnectionManager>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let config = connections.wallet_config();
        Self {
            poll_interval: config.poll_interval(),
            dropped_timeout: chrono::Duration::seconds(config.dropped_timeout_secs as i64),
            batch_size: config.batch_size,
            batch_delay: config.batch_delay(),
            ledger,
            connections,
            scheduler,
            arm_generation: Mutex::new(0),
        }
    }

    pub fn ledger(&self) -> &Arc<PendingLedger> {
        &self.ledger
    }

    /// Register this poller as the scheduler's tick handler
    pub fn install(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.on_tick(Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(poller) = weak.upgrade() {
                    if let Err(e) = poller.tick().await {
                        warn!("Poll tick failed: {}", e);
                    }
                }
            }
            .boxed()
        }));
    }

    /// Re-arm after a restart when the store still holds pending entries
    pub async fn resume(&self) -> WalletResult<bool> {
        let pending = self.ledger.pending_count().await?;
        metrics::set_pending_transactions(pending);
        if pending == 0 {
            return Ok(false);
        }

        info!("Resuming poller with {} pending transactions", pending);
        self.arm();
        Ok(true)
    }

    /// Record a submitted transaction, arm polling and check it once right away
    pub async fn track(&self, record: PendingTransaction) -> WalletResult<bool> {
        if !self.ledger.submit(record.clone()).await? {
            return Ok(false);
        }
        self.after_insert(&record).await;
        Ok(true)
    }

    /// Like `track`, for a transaction replacing `original_hash`
    pub async fn track_replacement(
        &self,
        original_hash: H256,
        record: PendingTransaction,
    ) -> WalletResult<bool> {
        if !self.ledger.record_replacement(original_hash, record.clone()).await? {
            return Ok(false);
        }
        self.after_insert(&record).await;
        Ok(true)
    }

    async fn after_insert(&self, record: &PendingTransaction) {
        metrics::record_tx_submitted(&record.chain_key);
        self.arm();
        if let Err(e) = self.check_now(record).await {
            debug!("Immediate status check for {:?} failed: {}", record.hash, e);
        }
    }

    /// Out-of-band reconciliation of the account that sent `record`
    pub async fn check_now(&self, record: &PendingTransaction) -> WalletResult<TickReport> {
        let account = AccountRef::new(&record.chain_key, record.from);
        self.reconcile_account(&account, Utc::now()).await
    }

    fn arm(&self) {
        let mut generation = self
            .arm_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.scheduler.arm(self.poll_interval);
    }

    fn generation(&self) -> u64 {
        *self
            .arm_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Disarm unless something was armed after `seen` was read
    fn disarm_if_idle(&self, seen: u64) -> bool {
        let generation = self
            .arm_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *generation != seen {
            return false;
        }
        self.scheduler.disarm();
        true
    }

    pub async fn tick(&self) -> WalletResult<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// One pass over every account with pending entries
    pub async fn tick_at(&self, now: DateTime<Utc>) -> WalletResult<TickReport> {
        metrics::record_poll_tick();
        let generation = self.generation();
        let mut report = TickReport::default();

        for account in self.ledger.accounts().await? {
            match self.reconcile_account(&account, now).await {
                Ok(account_report) => report.merge(&account_report),
                Err(e) => warn!(
                    "Reconciling {:?} on {} failed: {}",
                    account.address, account.chain_key, e
                ),
            }
        }

        report.pruned = self.ledger.prune(now).await?;
        report.still_pending = self.ledger.pending_count().await?;
        metrics::set_pending_transactions(report.still_pending);

        if report.still_pending == 0 {
            if self.disarm_if_idle(generation) {
                info!("No pending transactions left, poller idle");
            } else {
                debug!("Transaction tracked during tick, poller stays armed");
            }
        }

        debug!("Poll tick: {:?}", report);
        Ok(report)
    }

    async fn reconcile_account(
        &self,
        account: &AccountRef,
        now: DateTime<Utc>,
    ) -> WalletResult<TickReport> {
        let chain_key = account.chain_key.as_str();
        let pending = self
            .ledger
            .pending_entries(chain_key, account.address)
            .await?;
        if pending.is_empty() {
            return Ok(TickReport::default());
        }

        let hashes: Vec<H256> = pending.iter().map(|e| e.hash).collect();
        let receipts = run_bounded(
            hashes,
            self.batch_size,
            self.batch_delay,
            |hash| {
                self.connections.execute(chain_key, move |rpc| async move {
                    rpc.get_transaction_receipt(hash).await
                })
            },
        )
        .await;

        let mut confirmed_nonce: Option<u64> = None;
        let mut outcomes = Vec::with_capacity(pending.len());

        for (entry, receipt) in pending.iter().zip(receipts) {
            let outcome = match receipt {
                Err(e) => {
                    warn!("Receipt lookup for {:?} on {} failed: {}", entry.hash, chain_key, e);
                    continue;
                }
                Ok(Some(receipt)) => Outcome::Receipt(ReceiptSummary::from(&receipt)),
                Ok(None) if now - entry.submitted_at > self.dropped_timeout => {
                    let confirmed = match confirmed_nonce {
                        Some(nonce) => nonce,
                        None => match self.confirmed_nonce(account).await {
                            Ok(nonce) => {
                                confirmed_nonce = Some(nonce);
                                nonce
                            }
                            Err(e) => {
                                warn!("Nonce lookup for {:?} failed: {}", account.address, e);
                                continue;
                            }
                        },
                    };
                    if confirmed > entry.nonce {
                        Outcome::NonceConsumed
                    } else {
                        Outcome::Unchanged
                    }
                }
                Ok(None) => Outcome::Unchanged,
            };
            outcomes.push((entry.hash, outcome));
        }

        let report = self
            .ledger
            .update(account, |entries| apply_outcomes(entries, outcomes, now))
            .await?;

        for (status, count) in [
            (TxStatus::Mined, report.mined),
            (TxStatus::Failed, report.failed),
            (TxStatus::Dropped, report.dropped),
            (TxStatus::Replaced, report.replaced),
        ] {
            metrics::record_tx_completed(chain_key, status, count);
        }
        Ok(report)
    }

    async fn confirmed_nonce(&self, account: &AccountRef) -> WalletResult<u64> {
        let address = account.address;
        self.connections
            .execute(&account.chain_key, move |rpc| async move {
                rpc.get_transaction_count(address, BlockTag::Latest).await
            })
            .await
    }
}

fn apply_outcomes(
    entries: &mut [PendingTransaction],
    outcomes: Vec<(H256, Outcome)>,
    now: DateTime<Utc>,
) -> TickReport {
    let mut report = TickReport::default();
    let mut consumed = Vec::new();

    for (hash, outcome) in outcomes {
        // Skip entries another writer completed since the snapshot
        let Some(entry) = entries.iter_mut().find(|e| e.hash == hash && e.is_pending()) else {
            continue;
        };
        report.checked += 1;
        entry.last_checked_at = Some(now);

        match outcome {
            Outcome::Receipt(summary) => {
                if summary.success {
                    entry.status = TxStatus::Mined;
                    report.mined += 1;
                } else {
                    entry.status = TxStatus::Failed;
                    entry.error_reason = Some("execution reverted".to_string());
                    report.failed += 1;
                }
                info!(
                    "Transaction {:?} nonce {} {} in block {:?}",
                    entry.hash, entry.nonce, entry.status, summary.block_number
                );
                entry.receipt = Some(summary);
            }
            Outcome::NonceConsumed => consumed.push(hash),
            Outcome::Unchanged => {}
        }
    }

    // A pending entry loses its nonce to a mined sibling
    let mined: Vec<(u64, H256)> = entries
        .iter()
        .filter(|e| e.status == TxStatus::Mined)
        .map(|e| (e.nonce, e.hash))
        .collect();

    for entry in entries.iter_mut().filter(|e| e.is_pending()) {
        let winner = mined
            .iter()
            .find(|(nonce, hash)| *nonce == entry.nonce && *hash != entry.hash);
        if let Some((_, winner)) = winner {
            entry.status = TxStatus::Replaced;
            entry.replaced_by_hash = Some(*winner);
            entry.last_checked_at = Some(now);
            report.replaced += 1;
            info!("Transaction {:?} replaced by {:?}", entry.hash, winner);
        }
    }

    for hash in consumed {
        if let Some(entry) = entries.iter_mut().find(|e| e.hash == hash && e.is_pending()) {
            entry.status = TxStatus::Dropped;
            entry.error_reason =
                Some("nonce was consumed by a transaction this wallet does not know".to_string());
            report.dropped += 1;
            warn!("Transaction {:?} nonce {} dropped", entry.hash, entry.nonce);
        }
    }

    report
}
