//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Next-nonce selection from on-chain and locally pending state
//! - External signer activity and nonce gap detection
//! - Replacement eligibility
//! - Per-account serialization of nonce assignment

use crate::chain::{BlockTag, ConnectionManager};
use crate::error::{WalletError, WalletResult};
use crate::ledger::{PendingLedger, PendingTransaction};

use dashmap::DashMap;
use ethers::types::Address;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Nonce view of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceStatus {
    pub confirmed_nonce: u64,
    pub pending_nonce: u64,
    pub next_safe_nonce: u64,
    pub local_pending_count: usize,
    pub external_activity_detected: bool,
}

/// Nonces missing between the confirmed nonce and the highest local pending nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapReport {
    pub has_gap: bool,
    pub missing: Vec<u64>,
    pub expected_next: u64,
}

pub struct NonceCoordinator {
    connections: Arc<ConnectionManager>,
    ledger: Arc<PendingLedger>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NonceCoordinator {
    pub fn new(connections: Arc<ConnectionManager>, ledger: Arc<PendingLedger>) -> Self {
        Self {
            connections,
            ledger,
            locks: DashMap::new(),
        }
    }

    /// Serialize read-nonce, broadcast and ledger insert for one account
    pub async fn lock_account(&self, chain_key: &str, address: Address) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(format!("{}:{:?}", chain_key, address))
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Never below the node's pending nonce, never a nonce held by a local pending entry
    pub async fn next_nonce(&self, chain_key: &str, address: Address) -> WalletResult<u64> {
        let onchain_pending = self.onchain_nonce(chain_key, address, BlockTag::Pending).await?;
        let local = self.local_pending_nonces(chain_key, address).await?;
        let next = next_safe(onchain_pending, &local);
        debug!(
            "Next nonce for {:?} on {}: {} (node pending {})",
            address, chain_key, next, onchain_pending
        );
        Ok(next)
    }

    pub async fn status(&self, chain_key: &str, address: Address) -> WalletResult<NonceStatus> {
        let confirmed_nonce = self.onchain_nonce(chain_key, address, BlockTag::Latest).await?;
        let pending_nonce = self.onchain_nonce(chain_key, address, BlockTag::Pending).await?;
        let local = self.local_pending_nonces(chain_key, address).await?;

        let external_activity_detected = local
            .last()
            .map(|highest| pending_nonce > highest + 1)
            .unwrap_or(false);
        if external_activity_detected {
            warn!(
                "Node pending nonce {} for {:?} on {} is ahead of local state",
                pending_nonce, address, chain_key
            );
        }

        Ok(NonceStatus {
            confirmed_nonce,
            pending_nonce,
            next_safe_nonce: next_safe(pending_nonce, &local),
            local_pending_count: local.len(),
            external_activity_detected,
        })
    }

    pub async fn detect_gap(&self, chain_key: &str, address: Address) -> WalletResult<GapReport> {
        let status = self.status(chain_key, address).await?;
        let local = self.local_pending_nonces(chain_key, address).await?;

        let missing: Vec<u64> = match local.last() {
            Some(&highest) => (status.confirmed_nonce..=highest)
                .filter(|nonce| local.binary_search(nonce).is_err())
                .collect(),
            None => Vec::new(),
        };

        if !missing.is_empty() {
            warn!(
                "Nonce gap for {:?} on {}: missing {:?}",
                address, chain_key, missing
            );
        }

        Ok(GapReport {
            has_gap: !missing.is_empty(),
            expected_next: missing.first().copied().unwrap_or(status.next_safe_nonce),
            missing,
        })
    }

    /// The pending entry that currently holds `nonce`, if it may be replaced
    pub async fn validate_replacement(
        &self,
        chain_key: &str,
        address: Address,
        nonce: u64,
    ) -> WalletResult<PendingTransaction> {
        let confirmed = self.onchain_nonce(chain_key, address, BlockTag::Latest).await?;
        if nonce < confirmed {
            return Err(WalletError::ReplacementNotEligible {
                reason: format!(
                    "nonce {} is already confirmed on {} (confirmed nonce {})",
                    nonce, chain_key, confirmed
                ),
            });
        }

        self.ledger
            .pending_entries(chain_key, address)
            .await?
            .into_iter()
            .find(|e| e.nonce == nonce && e.replaced_by_hash.is_none())
            .ok_or_else(|| WalletError::ReplacementNotEligible {
                reason: format!(
                    "no pending transaction from {:?} at nonce {} on {}",
                    address, nonce, chain_key
                ),
            })
    }

    async fn onchain_nonce(
        &self,
        chain_key: &str,
        address: Address,
        tag: BlockTag,
    ) -> WalletResult<u64> {
        self.connections
            .execute(chain_key, move |rpc| async move {
                rpc.get_transaction_count(address, tag).await
            })
            .await
    }

    /// Sorted, distinct nonces of local pending entries
    async fn local_pending_nonces(
        &self,
        chain_key: &str,
        address: Address,
    ) -> WalletResult<Vec<u64>> {
        let mut nonces: Vec<u64> = self
            .ledger
            .pending_entries(chain_key, address)
            .await?
            .iter()
            .map(|e| e.nonce)
            .collect();
        nonces.sort_unstable();
        nonces.dedup();
        Ok(nonces)
    }
}

fn next_safe(onchain_pending: u64, local_sorted: &[u64]) -> u64 {
    match local_sorted.last() {
        Some(highest) => onchain_pending.max(highest + 1),
        None => onchain_pending,
    }
}
