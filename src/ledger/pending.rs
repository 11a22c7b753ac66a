//! Durable per-account transaction ledger

use super::{PendingTransaction, TxStatus};
use crate::config::WalletConfig;
use crate::error::{WalletError, WalletResult};
use crate::state::{load_json, save_json, DurableStore};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

const INDEX_KEY: &str = "pending:index";

/// A `(chain, address)` pair with ledger entries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRef {
    pub chain_key: String,
    pub address: Address,
}

impl AccountRef {
    pub fn new(chain_key: &str, address: Address) -> Self {
        Self {
            chain_key: chain_key.to_string(),
            address,
        }
    }

    fn storage_key(&self) -> String {
        format!("pending:{}:{:?}", self.chain_key, self.address)
    }
}

/// Submitted transactions per account, persisted in a `DurableStore`
pub struct PendingLedger {
    store: Arc<dyn DurableStore>,
    max_per_account: usize,
    retention: chrono::Duration,
    locks: DashMap<AccountRef, Arc<Mutex<()>>>,
    index_lock: Mutex<()>,
}

impl PendingLedger {
    pub fn new(store: Arc<dyn DurableStore>, config: &WalletConfig) -> Self {
        Self {
            store,
            max_per_account: config.max_pending_per_account.max(1),
            retention: chrono::Duration::seconds(config.retention_secs as i64),
            locks: DashMap::new(),
            index_lock: Mutex::new(()),
        }
    }

    /// Record a new transaction.
    ///
    /// Returns `false` when a record with the same hash already exists.
    pub async fn submit(&self, record: PendingTransaction) -> WalletResult<bool> {
        let account = AccountRef::new(&record.chain_key, record.from);
        let _guard = self.lock(&account).await;
        let mut entries = self.load(&account).await?;

        if entries.iter().any(|e| e.hash == record.hash) {
            debug!("Transaction {:?} already recorded", record.hash);
            return Ok(false);
        }

        if let Some(existing) = entries
            .iter()
            .find(|e| e.is_pending() && e.nonce == record.nonce && e.replaced_by_hash.is_none())
        {
            return Err(WalletError::NonceConflict(format!(
                "nonce {} on {} is already used by pending transaction {:?}",
                record.nonce, record.chain_key, existing.hash
            )));
        }

        info!(
            "Recorded transaction {:?} nonce {} on {}",
            record.hash, record.nonce, record.chain_key
        );
        entries.push(record);
        self.save(&account, &entries).await?;
        self.add_to_index(&account).await?;
        Ok(true)
    }

    /// Record `record` as the replacement of the pending transaction `original_hash`.
    ///
    /// The original stays pending and is linked through `replaced_by_hash`.
    pub async fn record_replacement(
        &self,
        original_hash: H256,
        record: PendingTransaction,
    ) -> WalletResult<bool> {
        let account = AccountRef::new(&record.chain_key, record.from);
        let _guard = self.lock(&account).await;
        let mut entries = self.load(&account).await?;

        if entries.iter().any(|e| e.hash == record.hash) {
            return Ok(false);
        }

        let original = entries
            .iter_mut()
            .find(|e| e.hash == original_hash)
            .ok_or_else(|| WalletError::TransactionNotFound {
                tx_hash: format!("{:?}", original_hash),
            })?;

        if !original.is_pending() {
            return Err(WalletError::ReplacementNotEligible {
                reason: format!(
                    "transaction {:?} is already {}",
                    original_hash, original.status
                ),
            });
        }
        if let Some(newer) = original.replaced_by_hash {
            return Err(WalletError::ReplacementNotEligible {
                reason: format!(
                    "transaction {:?} was already replaced by {:?}",
                    original_hash, newer
                ),
            });
        }
        if original.nonce != record.nonce {
            return Err(WalletError::Validation(format!(
                "replacement nonce {} does not match original nonce {}",
                record.nonce, original.nonce
            )));
        }

        original.replaced_by_hash = Some(record.hash);
        info!(
            "Transaction {:?} replaced by {:?} at nonce {}",
            original_hash, record.hash, record.nonce
        );
        entries.push(record);
        self.save(&account, &entries).await?;
        self.add_to_index(&account).await?;
        Ok(true)
    }

    /// All entries for an account, oldest first
    pub async fn entries(
        &self,
        chain_key: &str,
        address: Address,
    ) -> WalletResult<Vec<PendingTransaction>> {
        self.load(&AccountRef::new(chain_key, address)).await
    }

    pub async fn pending_entries(
        &self,
        chain_key: &str,
        address: Address,
    ) -> WalletResult<Vec<PendingTransaction>> {
        Ok(self
            .entries(chain_key, address)
            .await?
            .into_iter()
            .filter(|e| e.is_pending())
            .collect())
    }

    pub async fn find(
        &self,
        chain_key: &str,
        address: Address,
        hash: H256,
    ) -> WalletResult<Option<PendingTransaction>> {
        Ok(self
            .entries(chain_key, address)
            .await?
            .into_iter()
            .find(|e| e.hash == hash))
    }

    /// Accounts with at least one stored entry
    pub async fn accounts(&self) -> WalletResult<Vec<AccountRef>> {
        Ok(load_json(self.store.as_ref(), INDEX_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn pending_count(&self) -> WalletResult<usize> {
        let mut count = 0;
        for account in self.accounts().await? {
            count += self
                .load(&account)
                .await?
                .iter()
                .filter(|e| e.is_pending())
                .count();
        }
        Ok(count)
    }

    pub async fn has_pending(&self) -> WalletResult<bool> {
        Ok(self.pending_count().await? > 0)
    }

    /// Apply `f` to an account's entries under its lock and persist the result
    pub async fn update<F, R>(&self, account: &AccountRef, f: F) -> WalletResult<R>
    where
        F: FnOnce(&mut Vec<PendingTransaction>) -> R,
    {
        let _guard = self.lock(account).await;
        let mut entries = self.load(account).await?;
        let result = f(&mut entries);
        self.save(account, &entries).await?;
        Ok(result)
    }

    /// Remove completed entries past retention or over the per-account cap.
    ///
    /// Pending entries are never removed. Returns the number of pruned entries.
    pub async fn prune(&self, now: DateTime<Utc>) -> WalletResult<usize> {
        let mut pruned = 0;
        let mut emptied = Vec::new();

        for account in self.accounts().await? {
            let _guard = self.lock(&account).await;
            let mut entries = self.load(&account).await?;
            let removed = self.apply_retention(&mut entries, now);
            if removed == 0 {
                continue;
            }

            pruned += removed;
            if entries.is_empty() {
                self.store.remove(&account.storage_key()).await?;
                emptied.push(account);
            } else {
                self.save(&account, &entries).await?;
            }
        }

        if !emptied.is_empty() {
            let _guard = self.index_lock.lock().await;
            let mut index = Vec::new();
            for account in self.accounts().await? {
                // An entry may have been submitted since the account was emptied
                if !emptied.contains(&account) || !self.load(&account).await?.is_empty() {
                    index.push(account);
                }
            }
            save_json(self.store.as_ref(), INDEX_KEY, &index).await?;
        }

        if pruned > 0 {
            info!("Pruned {} completed transactions", pruned);
        }
        Ok(pruned)
    }

    fn apply_retention(&self, entries: &mut Vec<PendingTransaction>, now: DateTime<Utc>) -> usize {
        let before = entries.len();
        let cutoff = now - self.retention;
        entries.retain(|e| e.is_pending() || e.submitted_at >= cutoff);

        if entries.len() > self.max_per_account {
            let mut completed: Vec<(DateTime<Utc>, H256)> = entries
                .iter()
                .filter(|e| e.status != TxStatus::Pending)
                .map(|e| (e.submitted_at, e.hash))
                .collect();
            completed.sort();

            let excess = entries.len() - self.max_per_account;
            let evicted: HashSet<H256> = completed
                .into_iter()
                .take(excess)
                .map(|(_, hash)| hash)
                .collect();
            entries.retain(|e| !evicted.contains(&e.hash));
        }

        before - entries.len()
    }

    async fn lock(&self, account: &AccountRef) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(account.clone()).or_default().clone();
        lock.lock_owned().await
    }

    async fn load(&self, account: &AccountRef) -> WalletResult<Vec<PendingTransaction>> {
        Ok(load_json(self.store.as_ref(), &account.storage_key())
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, account: &AccountRef, entries: &[PendingTransaction]) -> WalletResult<()> {
        save_json(self.store.as_ref(), &account.storage_key(), entries).await
    }

    async fn add_to_index(&self, account: &AccountRef) -> WalletResult<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.accounts().await?;
        if !index.contains(account) {
            index.push(account.clone());
            save_json(self.store.as_ref(), INDEX_KEY, &index).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::testing::{address, hash, pending_tx};

    fn ledger_with(config: WalletConfig) -> (Arc<MemoryStore>, PendingLedger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = PendingLedger::new(store.clone(), &config);
        (store, ledger)
    }

    fn completed(hash_byte: u8, nonce: u64, age_secs: i64, status: TxStatus) -> PendingTransaction {
        let mut tx = pending_tx(hash_byte, nonce, Utc::now() - chrono::Duration::seconds(age_secs));
        tx.status = status;
        tx
    }

    #[tokio::test]
    async fn test_duplicate_hash_is_ignored() {
        let (_, ledger) = ledger_with(WalletConfig::default());
        let tx = pending_tx(0xab, 5, Utc::now());

        assert!(ledger.submit(tx.clone()).await.unwrap());
        assert!(!ledger.submit(tx).await.unwrap());
        assert_eq!(ledger.entries("eth", address(0xaa)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_pending_at_same_nonce_conflicts() {
        let (_, ledger) = ledger_with(WalletConfig::default());
        ledger.submit(pending_tx(1, 5, Utc::now())).await.unwrap();

        let err = ledger.submit(pending_tx(2, 5, Utc::now())).await.unwrap_err();
        assert_eq!(err.kind(), "nonce_conflict");
    }

    #[tokio::test]
    async fn test_completed_nonce_can_be_reused() {
        let (_, ledger) = ledger_with(WalletConfig::default());
        ledger
            .submit(completed(1, 5, 10, TxStatus::Dropped))
            .await
            .unwrap();
        assert!(ledger.submit(pending_tx(2, 5, Utc::now())).await.unwrap());
    }

    #[tokio::test]
    async fn test_replacement_links_original() {
        let (_, ledger) = ledger_with(WalletConfig::default());
        ledger.submit(pending_tx(1, 5, Utc::now())).await.unwrap();

        assert!(ledger
            .record_replacement(hash(1), pending_tx(2, 5, Utc::now()))
            .await
            .unwrap());

        let original = ledger.find("eth", address(0xaa), hash(1)).await.unwrap().unwrap();
        assert_eq!(original.replaced_by_hash, Some(hash(2)));
        assert_eq!(original.status, TxStatus::Pending);
        assert_eq!(ledger.pending_entries("eth", address(0xaa)).await.unwrap().len(), 2);

        // The original may not be replaced twice
        let err = ledger
            .record_replacement(hash(1), pending_tx(3, 5, Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "replacement_not_eligible");
    }

    #[tokio::test]
    async fn test_replacement_of_unknown_hash() {
        let (_, ledger) = ledger_with(WalletConfig::default());
        let err = ledger
            .record_replacement(hash(9), pending_tx(2, 5, Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_state_survives_new_ledger_instance() {
        let (store, ledger) = ledger_with(WalletConfig::default());
        ledger.submit(pending_tx(1, 5, Utc::now())).await.unwrap();
        drop(ledger);

        let reopened = PendingLedger::new(store, &WalletConfig::default());
        assert!(reopened.has_pending().await.unwrap());
        assert_eq!(
            reopened.accounts().await.unwrap(),
            vec![AccountRef::new("eth", address(0xaa))]
        );
    }

    #[tokio::test]
    async fn test_prune_removes_old_completed_only() {
        let config = WalletConfig {
            retention_secs: 3600,
            ..WalletConfig::default()
        };
        let (_, ledger) = ledger_with(config);
        ledger.submit(completed(1, 1, 7200, TxStatus::Mined)).await.unwrap();
        ledger.submit(completed(2, 2, 60, TxStatus::Mined)).await.unwrap();
        ledger.submit(completed(3, 3, 7200, TxStatus::Pending)).await.unwrap();

        assert_eq!(ledger.prune(Utc::now()).await.unwrap(), 1);
        let hashes: Vec<H256> = ledger
            .entries("eth", address(0xaa))
            .await
            .unwrap()
            .iter()
            .map(|e| e.hash)
            .collect();
        assert_eq!(hashes, vec![hash(2), hash(3)]);
    }

    #[tokio::test]
    async fn test_cap_prunes_oldest_completed_first() {
        let config = WalletConfig {
            max_pending_per_account: 3,
            ..WalletConfig::default()
        };
        let (_, ledger) = ledger_with(config);
        ledger.submit(completed(1, 1, 500, TxStatus::Pending)).await.unwrap();
        ledger.submit(completed(2, 2, 400, TxStatus::Mined)).await.unwrap();
        ledger.submit(completed(3, 3, 300, TxStatus::Failed)).await.unwrap();
        ledger.submit(completed(4, 4, 200, TxStatus::Mined)).await.unwrap();
        ledger.submit(completed(5, 5, 100, TxStatus::Pending)).await.unwrap();

        assert_eq!(ledger.prune(Utc::now()).await.unwrap(), 2);
        let hashes: Vec<H256> = ledger
            .entries("eth", address(0xaa))
            .await
            .unwrap()
            .iter()
            .map(|e| e.hash)
            .collect();
        assert_eq!(hashes, vec![hash(1), hash(4), hash(5)]);
    }

    #[tokio::test]
    async fn test_emptied_account_leaves_index() {
        let config = WalletConfig {
            retention_secs: 60,
            ..WalletConfig::default()
        };
        let (store, ledger) = ledger_with(config);
        ledger.submit(completed(1, 1, 600, TxStatus::Mined)).await.unwrap();

        ledger.prune(Utc::now()).await.unwrap();
        assert!(ledger.accounts().await.unwrap().is_empty());
        assert!(store.get("pending:eth:0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").await.unwrap().is_none());
    }
}
