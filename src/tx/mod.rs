//! Transaction lifecycle: fee quotes, nonce assignment, replacement and submission

mod gas;
mod nonce;
mod replacement;
mod sender;

pub use gas::{GasEstimate, GasEstimator};
pub use nonce::{GapReport, NonceCoordinator, NonceStatus};
pub use replacement::{
    ReplacementCalculator, ReplacementFees, ReplacementKind, ReplacementPresets,
    ReplacementValidation, MAX_BUMP_PERCENT,
};
pub use sender::{Confirmation, PreparedTransaction, SubmittedTransaction, TransactionSender};

use crate::error::{WalletError, WalletResult};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use serde::{Deserialize, Serialize};

/// What the caller wants to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxParams {
    pub from: Address,
    /// `None` deploys a contract
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
}

impl TxParams {
    pub fn transfer(from: Address, to: Address, value: U256) -> Self {
        Self {
            from,
            to: Some(to),
            value,
            data: Bytes::default(),
        }
    }

    /// Build from user-supplied address strings
    pub fn parse(from: &str, to: Option<&str>, value: U256, data: Bytes) -> WalletResult<Self> {
        let params = Self {
            from: parse_address(from)?,
            to: to.map(parse_address).transpose()?,
            value,
            data,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> WalletResult<()> {
        if self.to.is_none() && self.data.is_empty() {
            return Err(WalletError::Validation(
                "contract creation requires init code".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_contract_call(&self) -> bool {
        !self.data.is_empty()
    }
}

pub fn parse_address(raw: &str) -> WalletResult<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| WalletError::Validation(format!("malformed address: {}", raw)))
}

/// Fee fields of an unsigned transaction
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FeeFields {
    /// Gas price for legacy transactions
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: Option<U256>,
}

/// Assemble an unsigned transaction; EIP-1559 when a priority fee is given
pub(crate) fn build_transaction(
    params: &TxParams,
    chain_id: Option<u64>,
    nonce: Option<u64>,
    gas_limit: U256,
    fees: FeeFields,
) -> TypedTransaction {
    match fees.max_priority_fee_per_gas {
        Some(priority) => {
            let mut request = Eip1559TransactionRequest::new()
                .from(params.from)
                .value(params.value)
                .data(params.data.clone())
                .gas(gas_limit)
                .max_fee_per_gas(fees.max_fee_per_gas)
                .max_priority_fee_per_gas(priority);
            if let Some(chain_id) = chain_id {
                request = request.chain_id(chain_id);
            }
            if let Some(to) = params.to {
                request = request.to(to);
            }
            if let Some(nonce) = nonce {
                request = request.nonce(nonce);
            }
            request.into()
        }
        None => {
            let mut request = TransactionRequest::new()
                .from(params.from)
                .value(params.value)
                .data(params.data.clone())
                .gas(gas_limit)
                .gas_price(fees.max_fee_per_gas);
            if let Some(chain_id) = chain_id {
                request = request.chain_id(chain_id);
            }
            if let Some(to) = params.to {
                request = request.to(to);
            }
            if let Some(nonce) = nonce {
                request = request.nonce(nonce);
            }
            request.into()
        }
    }
}

/// `value * (100 + percent) / 100`, rounded up. Saturates at `U256::MAX`.
pub(crate) fn add_percent_ceil(value: U256, percent: u64) -> U256 {
    let factor = U256::from(100) + U256::from(percent);
    value
        .checked_mul(factor)
        .and_then(|scaled| scaled.checked_add(U256::from(99)))
        .map(|scaled| scaled / U256::from(100))
        .unwrap_or(U256::MAX)
}
