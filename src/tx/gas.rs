//! Gas limit and fee quotes for both fee models, including rollup data fees

use super::{add_percent_ceil, build_transaction, FeeFields, TxParams};
use crate::chain::{ConnectionManager, FeeData};
use crate::config::FeeConfig;
use crate::error::{WalletError, WalletResult};
use crate::metrics;

use ethers::abi::{self, ParamType, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use ethers::utils::{format_ether, id};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// A fee quote for one transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasEstimate {
    pub gas_limit: U256,
    /// Max fee per gas, or the gas price for legacy chains
    pub gas_price_or_max_fee: U256,
    pub max_priority_fee: Option<U256>,
    pub l1_data_fee: U256,
    pub total_fee: U256,
    /// `total_fee` in ether
    pub total_fee_formatted: String,
    pub is_fee_model_eip1559: bool,
    pub exceeds_price_warning: bool,
}

impl GasEstimate {
    pub(crate) fn fee_fields(&self) -> FeeFields {
        FeeFields {
            max_fee_per_gas: self.gas_price_or_max_fee,
            max_priority_fee_per_gas: self.max_priority_fee,
        }
    }
}

/// Gas estimator for transactions
pub struct GasEstimator {
    connections: Arc<ConnectionManager>,
    fees: FeeConfig,
}

impl GasEstimator {
    pub fn new(connections: Arc<ConnectionManager>, fees: FeeConfig) -> Self {
        Self { connections, fees }
    }

    pub fn fee_config(&self) -> &FeeConfig {
        &self.fees
    }

    /// Current network fee data for a chain
    pub async fn fee_data(&self, chain_key: &str) -> WalletResult<FeeData> {
        self.connections
            .execute(chain_key, |rpc| async move { rpc.get_fee_data().await })
            .await
    }

    /// Quote gas limit and fees.
    ///
    /// Fails only on invalid params or when no endpoint returns fee data.
    /// Gas estimation and rollup oracle failures fall back to defaults.
    pub async fn estimate(&self, chain_key: &str, params: &TxParams) -> WalletResult<GasEstimate> {
        params.validate()?;
        let chain_id = self.connections.evm_chain_id(chain_key)?;
        let oracle = self.connections.chain(chain_key)?.l1_fee_oracle;

        let fee_data = self.fee_data(chain_key).await?;
        let raw_limit = self.estimate_gas_limit(chain_key, params, chain_id).await;
        let gas_limit = add_percent_ceil(raw_limit, self.fees.gas_limit_buffer_percent);

        let (unit_price, max_priority_fee) = match (
            fee_data.max_fee_per_gas,
            fee_data.max_priority_fee_per_gas,
        ) {
            (Some(max_fee), Some(priority)) => (max_fee, Some(priority)),
            _ => (
                fee_data.gas_price.ok_or_else(|| {
                    WalletError::NodeRejected(format!("no gas price returned for {}", chain_key))
                })?,
                None,
            ),
        };

        let unit_price = unit_price.max(self.fees.min_gas_price());
        let exceeds_price_warning = unit_price > self.fees.warning_threshold();
        if exceeds_price_warning {
            warn!(
                "Gas price on {} is {} wei, above the warning threshold",
                chain_key, unit_price
            );
        }

        let fees = FeeFields {
            max_fee_per_gas: unit_price,
            max_priority_fee_per_gas: max_priority_fee,
        };

        let l1_data_fee = match oracle {
            Some(oracle) => {
                let envelope = build_transaction(params, Some(chain_id), Some(0), gas_limit, fees);
                self.l1_data_fee(chain_key, oracle, &envelope).await
            }
            None => U256::zero(),
        };

        let total_fee = gas_limit * unit_price + l1_data_fee;
        metrics::record_fee_quote(chain_key, unit_price.low_u128() as f64 / 1e9);
        debug!(
            "Quote on {}: gas {} at {} wei, l1 fee {}, total {}",
            chain_key, gas_limit, unit_price, l1_data_fee, total_fee
        );

        Ok(GasEstimate {
            gas_limit,
            gas_price_or_max_fee: unit_price,
            max_priority_fee,
            l1_data_fee,
            total_fee,
            total_fee_formatted: format_ether(total_fee),
            is_fee_model_eip1559: max_priority_fee.is_some(),
            exceeds_price_warning,
        })
    }

    async fn estimate_gas_limit(&self, chain_key: &str, params: &TxParams, chain_id: u64) -> U256 {
        let mut request = TransactionRequest::new()
            .from(params.from)
            .value(params.value)
            .data(params.data.clone())
            .chain_id(chain_id);
        if let Some(to) = params.to {
            request = request.to(to);
        }
        let request: TypedTransaction = request.into();

        let estimated = self
            .connections
            .execute(chain_key, |rpc| {
                let request = request.clone();
                async move { rpc.estimate_gas(&request).await }
            })
            .await;

        match estimated {
            Ok(gas) => gas,
            Err(e) => {
                let fallback = if params.is_contract_call() {
                    self.fees.default_contract_gas
                } else {
                    self.fees.default_transfer_gas
                };
                debug!(
                    "Gas estimation on {} failed ({}), using default {}",
                    chain_key, e, fallback
                );
                U256::from(fallback)
            }
        }
    }

    /// `getL1Fee(bytes)` on the rollup's gas price oracle
    async fn l1_data_fee(
        &self,
        chain_key: &str,
        oracle: Address,
        envelope: &TypedTransaction,
    ) -> U256 {
        let mut calldata = id("getL1Fee(bytes)").to_vec();
        calldata.extend(abi::encode(&[Token::Bytes(envelope.rlp().to_vec())]));
        let call: TypedTransaction = TransactionRequest::new()
            .to(oracle)
            .data(Bytes::from(calldata))
            .into();

        let fallback = U256::from(self.fees.l1_data_fee_fallback_wei);
        let result = self
            .connections
            .execute(chain_key, |rpc| {
                let call = call.clone();
                async move { rpc.call(&call).await }
            })
            .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                warn!("L1 fee oracle call on {} failed, using fallback: {}", chain_key, e);
                return fallback;
            }
        };

        match abi::decode(&[ParamType::Uint(256)], &raw) {
            Ok(tokens) => match tokens.into_iter().next() {
                Some(Token::Uint(fee)) => fee,
                _ => fallback,
            },
            Err(e) => {
                warn!("Undecodable L1 fee from {} oracle: {}", chain_key, e);
                fallback
            }
        }
    }
}
