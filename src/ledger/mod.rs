//! Pending transaction ledger and poller
//!
//! Every submitted transaction is recorded durably and reconciled against the
//! network until it reaches a terminal status:
//!
//! ```text
//! pending -> mined | failed | dropped | replaced
//! ```
//!
//! Drop and replace detection is best-effort. A transaction is reported as
//! `replaced` only when another locally known transaction with the same nonce
//! was mined; a replacement broadcast by a different wallet looks like a drop.

mod pending;
mod poller;
mod scheduler;

pub use pending::{AccountRef, PendingLedger};
pub use poller::{Poller, TickReport};
pub use scheduler::{Scheduler, TickHandler, TokioScheduler};

#[cfg(test)]
pub use scheduler::MockScheduler;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Mined,
    Failed,
    Dropped,
    Replaced,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Mined => "mined",
            TxStatus::Failed => "failed",
            TxStatus::Dropped => "dropped",
            TxStatus::Replaced => "replaced",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parts of a receipt kept with a completed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSummary {
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
}

impl From<&TransactionReceipt> for ReceiptSummary {
    fn from(receipt: &TransactionReceipt) -> Self {
        Self {
            success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            block_number: receipt.block_number.map(|b| b.as_u64()),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        }
    }
}

/// A transaction this wallet submitted, tracked until completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransaction {
    pub hash: H256,
    pub nonce: u64,
    pub chain_key: String,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: U256,
    /// Gas price for legacy transactions
    pub max_fee_per_gas: U256,
    /// `None` for legacy transactions
    pub max_priority_fee_per_gas: Option<U256>,
    pub submitted_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub status: TxStatus,
    pub replaced_by_hash: Option<H256>,
    pub receipt: Option<ReceiptSummary>,
    pub error_reason: Option<String>,
    pub is_testnet: bool,
}

impl PendingTransaction {
    pub fn is_pending(&self) -> bool {
        self.status == TxStatus::Pending
    }

    pub fn is_eip1559(&self) -> bool {
        self.max_priority_fee_per_gas.is_some()
    }
}
