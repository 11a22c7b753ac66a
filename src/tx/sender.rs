//! Transaction sender with nonce recovery, broadcast retry and replacement

use super::gas::{GasEstimate, GasEstimator};
use super::nonce::NonceCoordinator;
use super::replacement::{ReplacementCalculator, ReplacementKind};
use super::{build_transaction, TxParams};
use crate::chain::{BalanceCache, ConnectionManager};
use crate::error::{WalletError, WalletResult};
use crate::ledger::{Poller, PendingTransaction, ReceiptSummary, TxStatus};
use crate::metrics;
use crate::signer::ChainAdapter;

use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// An unsigned transaction with its nonce and fee quote
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
    pub tx: TypedTransaction,
    pub nonce: u64,
    pub estimate: GasEstimate,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedTransaction {
    pub hash: H256,
    pub nonce: u64,
    /// Set when the first nonce was rejected and a fresh one was used
    pub nonce_adjusted_from: Option<u64>,
    /// False when the transaction was broadcast but could not be recorded in the ledger
    pub tracked: bool,
    pub record: PendingTransaction,
}

/// Outcome of waiting for a receipt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    Mined { receipt: ReceiptSummary },
    Failed { receipt: ReceiptSummary },
    /// Still unknown after the wait; the poller keeps tracking it
    Unconfirmed { hash: H256 },
}

/// Transaction sender with retry and stuck transaction handling
pub struct TransactionSender {
    connections: Arc<ConnectionManager>,
    estimator: Arc<GasEstimator>,
    nonces: Arc<NonceCoordinator>,
    calculator: ReplacementCalculator,
    poller: Arc<Poller>,
    balances: Arc<BalanceCache>,
}

impl TransactionSender {
    pub fn new(
        connections: Arc<ConnectionManager>,
        estimator: Arc<GasEstimator>,
        nonces: Arc<NonceCoordinator>,
        calculator: ReplacementCalculator,
        poller: Arc<Poller>,
        balances: Arc<BalanceCache>,
    ) -> Self {
        Self {
            connections,
            estimator,
            nonces,
            calculator,
            poller,
            balances,
        }
    }

    /// Build the unsigned transaction with a fresh nonce and fee quote
    pub async fn prepare(
        &self,
        chain_key: &str,
        params: &TxParams,
    ) -> WalletResult<PreparedTransaction> {
        let chain_id = self.connections.evm_chain_id(chain_key)?;
        let estimate = self.estimator.estimate(chain_key, params).await?;
        let nonce = self.nonces.next_nonce(chain_key, params.from).await?;

        let tx = build_transaction(
            params,
            Some(chain_id),
            Some(nonce),
            estimate.gas_limit,
            estimate.fee_fields(),
        );
        debug!(
            "Prepared transaction from {:?} on {} with nonce {}",
            params.from, chain_key, nonce
        );

        Ok(PreparedTransaction {
            tx,
            nonce,
            estimate,
        })
    }

    /// Sign, broadcast and record a new transaction
    pub async fn send(
        &self,
        chain_key: &str,
        adapter: &dyn ChainAdapter,
        params: TxParams,
    ) -> WalletResult<SubmittedTransaction> {
        check_signer(adapter, params.from)?;
        let chain_id = self.connections.evm_chain_id(chain_key)?;
        let _guard = self.nonces.lock_account(chain_key, params.from).await;

        let prepared = self.prepare(chain_key, &params).await?;
        let (prepared, hash, nonce_adjusted_from) = match self
            .sign_and_broadcast(chain_key, adapter, &prepared.tx, chain_id)
            .await
        {
            Ok(hash) => (prepared, hash, None),
            Err(WalletError::NonceConflict(message)) => {
                warn!(
                    "Nonce {} rejected on {} ({}), re-reading nonce",
                    prepared.nonce, chain_key, message
                );
                let retry = self.prepare(chain_key, &params).await?;
                if retry.nonce == prepared.nonce {
                    return Err(WalletError::NonceConflict(message));
                }
                let hash = self
                    .sign_and_broadcast(chain_key, adapter, &retry.tx, chain_id)
                    .await?;
                (retry, hash, Some(prepared.nonce))
            }
            Err(e) => return Err(e),
        };

        let record = self.record(chain_key, hash, params.from, &prepared.tx)?;
        // Already broadcast: recording failures are logged, not returned
        let tracked = match self.poller.track(record.clone()).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Transaction {:?} was broadcast on {} but could not be recorded: {}",
                    hash, chain_key, e
                );
                false
            }
        };
        self.balances.invalidate(chain_key, params.from);

        info!(
            "Transaction {:?} sent from {:?} on {} with nonce {}",
            hash, params.from, chain_key, prepared.nonce
        );
        Ok(SubmittedTransaction {
            hash,
            nonce: prepared.nonce,
            nonce_adjusted_from,
            tracked,
            record,
        })
    }

    /// Speed up or cancel a pending transaction
    pub async fn replace(
        &self,
        chain_key: &str,
        adapter: &dyn ChainAdapter,
        original_hash: H256,
        kind: ReplacementKind,
        bump_percent: Option<u64>,
    ) -> WalletResult<SubmittedTransaction> {
        let from = adapter.address();
        let chain_id = self.connections.evm_chain_id(chain_key)?;
        let _guard = self.nonces.lock_account(chain_key, from).await;

        let original = self
            .poller
            .ledger()
            .find(chain_key, from, original_hash)
            .await?
            .ok_or_else(|| WalletError::TransactionNotFound {
                tx_hash: format!("{:?}", original_hash),
            })?;

        let current = self
            .nonces
            .validate_replacement(chain_key, from, original.nonce)
            .await?;
        if current.hash != original.hash {
            return Err(WalletError::ReplacementNotEligible {
                reason: format!(
                    "transaction {:?} was already replaced by {:?}",
                    original.hash, current.hash
                ),
            });
        }

        let mut tx = self.calculator.build(kind, &original, bump_percent)?;
        tx.set_chain_id(chain_id);

        let hash = self.sign_and_broadcast(chain_key, adapter, &tx, chain_id).await?;
        let record = self.record(chain_key, hash, from, &tx)?;
        let tracked = match self
            .poller
            .track_replacement(original.hash, record.clone())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Replacement {:?} of {:?} was broadcast but could not be recorded: {}",
                    hash, original.hash, e
                );
                false
            }
        };
        metrics::record_replacement(chain_key, kind.as_str());

        info!(
            "Transaction {:?} {} as {:?} at nonce {}",
            original.hash,
            kind.as_str(),
            hash,
            original.nonce
        );
        Ok(SubmittedTransaction {
            hash,
            nonce: original.nonce,
            nonce_adjusted_from: None,
            tracked,
            record,
        })
    }

    /// Submit a signed transaction. A node that already has it counts as success.
    pub async fn broadcast(&self, chain_key: &str, raw: Bytes) -> WalletResult<H256> {
        let local_hash = H256::from(keccak256(&raw));

        let result = self
            .connections
            .execute_with_retry(chain_key, |rpc| {
                let raw = raw.clone();
                async move { rpc.send_raw_transaction(raw).await }
            })
            .await;

        match result {
            Ok(hash) => Ok(hash),
            Err(e) if e.is_already_known() => {
                info!("Transaction {:?} already known on {}", local_hash, chain_key);
                Ok(local_hash)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll for a receipt until the confirmation timeout. Timing out is not an error.
    pub async fn wait_for_confirmation(
        &self,
        chain_key: &str,
        hash: H256,
    ) -> WalletResult<Confirmation> {
        let config = self.connections.wallet_config();
        let wait = Duration::from_secs(config.confirmation_timeout_secs);
        let interval = Duration::from_millis(config.confirmation_poll_ms);

        match timeout(wait, self.poll_receipt(chain_key, hash, interval)).await {
            Ok(Ok(receipt)) if receipt.success => Ok(Confirmation::Mined { receipt }),
            Ok(Ok(receipt)) => Ok(Confirmation::Failed { receipt }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                info!(
                    "Transaction {:?} unconfirmed after {:?}, poller keeps tracking it",
                    hash, wait
                );
                Ok(Confirmation::Unconfirmed { hash })
            }
        }
    }

    async fn poll_receipt(
        &self,
        chain_key: &str,
        hash: H256,
        interval: Duration,
    ) -> WalletResult<ReceiptSummary> {
        loop {
            let receipt = self
                .connections
                .execute(chain_key, move |rpc| async move {
                    rpc.get_transaction_receipt(hash).await
                })
                .await;

            match receipt {
                Ok(Some(receipt)) => return Ok(ReceiptSummary::from(&receipt)),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    debug!("Receipt poll for {:?} failed: {}", hash, e);
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn sign_and_broadcast(
        &self,
        chain_key: &str,
        adapter: &dyn ChainAdapter,
        tx: &TypedTransaction,
        chain_id: u64,
    ) -> WalletResult<H256> {
        let raw = adapter.sign_unsigned_tx(tx, chain_id).await?;
        self.broadcast(chain_key, raw).await
    }

    fn record(
        &self,
        chain_key: &str,
        hash: H256,
        from: Address,
        tx: &TypedTransaction,
    ) -> WalletResult<PendingTransaction> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = match tx {
            TypedTransaction::Eip1559(request) => (
                request.max_fee_per_gas.unwrap_or_default(),
                Some(request.max_priority_fee_per_gas.unwrap_or_default()),
            ),
            _ => (tx.gas_price().unwrap_or_default(), None),
        };

        Ok(PendingTransaction {
            hash,
            nonce: tx.nonce().map(|n| n.as_u64()).unwrap_or_default(),
            chain_key: chain_key.to_string(),
            from,
            to: tx.to().and_then(|to| to.as_address().copied()),
            value: tx.value().copied().unwrap_or_default(),
            data: tx.data().cloned().unwrap_or_default(),
            gas_limit: tx.gas().copied().unwrap_or_else(U256::zero),
            max_fee_per_gas,
            max_priority_fee_per_gas,
            submitted_at: Utc::now(),
            last_checked_at: None,
            status: TxStatus::Pending,
            replaced_by_hash: None,
            receipt: None,
            error_reason: None,
            is_testnet: self.connections.chain(chain_key)?.is_testnet(),
        })
    }
}

fn check_signer(adapter: &dyn ChainAdapter, from: Address) -> WalletResult<()> {
    if adapter.address() != from {
        return Err(WalletError::Validation(format!(
            "signer {:?} cannot send from {:?}",
            adapter.address(),
            from
        )));
    }
    Ok(())
}
