//! Fee-bumped speed-up and cancel transactions for stuck entries

use super::{add_percent_ceil, build_transaction, FeeFields, TxParams};
use crate::chain::FeeData;
use crate::config::FeeConfig;
use crate::error::{WalletError, WalletResult};
use crate::ledger::PendingTransaction;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Largest accepted bump, i.e. an 11x fee
pub const MAX_BUMP_PERCENT: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementKind {
    SpeedUp,
    Cancel,
}

impl ReplacementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplacementKind::SpeedUp => "speed_up",
            ReplacementKind::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplacementFees {
    pub max_fee_per_gas: U256,
    /// `None` for legacy transactions
    pub max_priority_fee_per_gas: Option<U256>,
    pub bump_percent: u64,
    pub exceeds_warning_threshold: bool,
    pub exceeds_hard_cap: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplacementPresets {
    pub slow: ReplacementFees,
    pub market: ReplacementFees,
    pub fast: ReplacementFees,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplacementValidation {
    pub valid: bool,
    pub error: Option<String>,
    pub warning: Option<String>,
}

pub struct ReplacementCalculator {
    fees: FeeConfig,
}

impl ReplacementCalculator {
    pub fn new(fees: FeeConfig) -> Self {
        Self { fees }
    }

    /// Same call with higher fees. `to`, `value`, `data`, `nonce` and gas limit are kept.
    pub fn speed_up(
        &self,
        original: &PendingTransaction,
        bump_percent: Option<u64>,
    ) -> WalletResult<TypedTransaction> {
        let fees = self.checked_fees(original, bump_percent)?;
        let params = TxParams {
            from: original.from,
            to: original.to,
            value: original.value,
            data: original.data.clone(),
        };
        Ok(unsigned(&params, original.nonce, original.gas_limit, &fees))
    }

    /// Zero-value self-send at the original nonce
    pub fn cancel(
        &self,
        original: &PendingTransaction,
        bump_percent: Option<u64>,
    ) -> WalletResult<TypedTransaction> {
        let fees = self.checked_fees(original, bump_percent)?;
        let params = TxParams::transfer(original.from, original.from, U256::zero());
        Ok(unsigned(
            &params,
            original.nonce,
            U256::from(self.fees.cancel_gas_limit),
            &fees,
        ))
    }

    pub fn build(
        &self,
        kind: ReplacementKind,
        original: &PendingTransaction,
        bump_percent: Option<u64>,
    ) -> WalletResult<TypedTransaction> {
        match kind {
            ReplacementKind::SpeedUp => self.speed_up(original, bump_percent),
            ReplacementKind::Cancel => self.cancel(original, bump_percent),
        }
    }

    /// Check caller-chosen fees against the minimum bump and the fee caps
    pub fn validate(
        &self,
        original: &PendingTransaction,
        new_max_fee: U256,
        new_priority_fee: Option<U256>,
    ) -> ReplacementValidation {
        match self.check(original, new_max_fee, new_priority_fee) {
            Ok(warning) => ReplacementValidation {
                valid: true,
                error: None,
                warning,
            },
            Err(e) => ReplacementValidation {
                valid: false,
                error: Some(e.to_string()),
                warning: None,
            },
        }
    }

    /// Like `validate`, as a result. `Ok` carries the non-blocking warning, if any.
    pub fn check(
        &self,
        original: &PendingTransaction,
        new_max_fee: U256,
        new_priority_fee: Option<U256>,
    ) -> WalletResult<Option<String>> {
        let min = self.minimum(original);

        if new_max_fee < min.max_fee_per_gas {
            return Err(WalletError::ReplacementUnderpriced {
                field: fee_field_name(original).to_string(),
                required: min.max_fee_per_gas.to_string(),
                provided: new_max_fee.to_string(),
            });
        }

        if let Some(required) = min.max_priority_fee_per_gas {
            let provided = new_priority_fee.unwrap_or_default();
            if provided < required {
                return Err(WalletError::ReplacementUnderpriced {
                    field: "maxPriorityFeePerGas".to_string(),
                    required: required.to_string(),
                    provided: provided.to_string(),
                });
            }
            if provided > new_max_fee {
                return Err(WalletError::Validation(format!(
                    "priority fee {} exceeds max fee {}",
                    provided, new_max_fee
                )));
            }
        }

        let cap = self.fees.hard_cap();
        if new_max_fee > cap {
            return Err(WalletError::FeeAboveCap {
                provided: new_max_fee.to_string(),
                cap: cap.to_string(),
            });
        }

        if new_max_fee > self.fees.warning_threshold() {
            let warning = format!(
                "{} of {} wei is above the {} gwei warning threshold",
                fee_field_name(original),
                new_max_fee,
                self.fees.fee_warning_gwei
            );
            warn!("Replacement for {:?}: {}", original.hash, warning);
            return Ok(Some(warning));
        }

        Ok(None)
    }

    /// Original fees raised by `bump_percent`, rounded up.
    ///
    /// Bumps below the network minimum are rejected with the minimum fee.
    pub fn bumped_fees(
        &self,
        original: &PendingTransaction,
        bump_percent: u64,
    ) -> WalletResult<ReplacementFees> {
        if bump_percent > MAX_BUMP_PERCENT {
            return Err(WalletError::Validation(format!(
                "bump of {}% exceeds the {}% maximum",
                bump_percent, MAX_BUMP_PERCENT
            )));
        }

        let bumped = self.flagged(
            add_percent_ceil(original.max_fee_per_gas, bump_percent),
            original
                .max_priority_fee_per_gas
                .map(|p| add_percent_ceil(p, bump_percent)),
            bump_percent,
        );

        if bump_percent < self.fees.min_bump_percent {
            return Err(WalletError::ReplacementUnderpriced {
                field: fee_field_name(original).to_string(),
                required: self.minimum(original).max_fee_per_gas.to_string(),
                provided: bumped.max_fee_per_gas.to_string(),
            });
        }
        Ok(bumped)
    }

    /// Slow, market and fast fees. Each tier takes the higher of the bumped
    /// original and the current network fee scaled by the same percentage.
    /// Legacy originals are compared against the network gas price.
    pub fn presets(&self, original: &PendingTransaction, network: &FeeData) -> ReplacementPresets {
        let network_max = if original.is_eip1559() {
            network.max_fee_per_gas.or(network.gas_price)
        } else {
            network.gas_price.or(network.max_fee_per_gas)
        }
        .unwrap_or_default();

        let tier = |percent: u64| {
            let max_fee = add_percent_ceil(original.max_fee_per_gas, percent)
                .max(add_percent_ceil(network_max, percent));

            let priority = original.max_priority_fee_per_gas.map(|p| {
                let network_priority = network.max_priority_fee_per_gas.unwrap_or_default();
                add_percent_ceil(p, percent)
                    .max(add_percent_ceil(network_priority, percent))
                    .min(max_fee)
            });

            self.flagged(max_fee, priority, percent)
        };

        let presets = ReplacementPresets {
            slow: tier(self.fees.min_bump_percent),
            market: tier(self.fees.default_bump_percent),
            fast: tier(self.fees.fast_bump_percent),
        };
        debug!("Replacement presets for {:?}: {:?}", original.hash, presets);
        presets
    }

    fn minimum(&self, original: &PendingTransaction) -> FeeFields {
        let percent = self.fees.min_bump_percent;
        FeeFields {
            max_fee_per_gas: add_percent_ceil(original.max_fee_per_gas, percent),
            max_priority_fee_per_gas: original
                .max_priority_fee_per_gas
                .map(|p| add_percent_ceil(p, percent)),
        }
    }

    fn checked_fees(
        &self,
        original: &PendingTransaction,
        bump_percent: Option<u64>,
    ) -> WalletResult<ReplacementFees> {
        let fees = self.bumped_fees(
            original,
            bump_percent.unwrap_or(self.fees.default_bump_percent),
        )?;
        self.check(original, fees.max_fee_per_gas, fees.max_priority_fee_per_gas)?;
        Ok(fees)
    }

    fn flagged(
        &self,
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: Option<U256>,
        bump_percent: u64,
    ) -> ReplacementFees {
        ReplacementFees {
            max_fee_per_gas,
            max_priority_fee_per_gas,
            bump_percent,
            exceeds_warning_threshold: max_fee_per_gas > self.fees.warning_threshold(),
            exceeds_hard_cap: max_fee_per_gas > self.fees.hard_cap(),
        }
    }
}

fn fee_field_name(original: &PendingTransaction) -> &'static str {
    if original.is_eip1559() {
        "maxFeePerGas"
    } else {
        "gasPrice"
    }
}

/// Chain id is left for the sender to set before signing
fn unsigned(params: &TxParams, nonce: u64, gas_limit: U256, fees: &ReplacementFees) -> TypedTransaction {
    build_transaction(
        params,
        None,
        Some(nonce),
        gas_limit,
        FeeFields {
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{address, fee_config, gwei, pending_tx};
    use chrono::Utc;
    use ethers::types::{Bytes, NameOrAddress};

    fn calculator() -> ReplacementCalculator {
        ReplacementCalculator::new(fee_config())
    }

    fn contract_call() -> PendingTransaction {
        let mut tx = pending_tx(1, 7, Utc::now());
        tx.data = Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb, 0x01]);
        tx.gas_limit = U256::from(65_000);
        tx
    }

    fn legacy() -> PendingTransaction {
        let mut tx = pending_tx(2, 3, Utc::now());
        tx.max_fee_per_gas = gwei(20);
        tx.max_priority_fee_per_gas = None;
        tx
    }

    #[test]
    fn test_speed_up_keeps_call_and_bumps_fees() {
        let original = contract_call();
        let tx = calculator().speed_up(&original, None).unwrap();

        assert_eq!(tx.to(), Some(&NameOrAddress::Address(address(0xbb))));
        assert_eq!(tx.value(), Some(&original.value));
        assert_eq!(tx.data(), Some(&original.data));
        assert_eq!(tx.nonce(), Some(&U256::from(7)));
        assert_eq!(tx.gas(), Some(&U256::from(65_000)));
        assert_eq!(tx.chain_id(), None);

        match tx {
            TypedTransaction::Eip1559(request) => {
                assert_eq!(request.max_fee_per_gas, Some(gwei(115)));
                assert_eq!(request.max_priority_fee_per_gas, Some(U256::from(2_300_000_000u64)));
            }
            other => panic!("expected an EIP-1559 transaction, got {:?}", other),
        }
    }

    #[test]
    fn test_cancel_is_zero_value_self_send() {
        let original = contract_call();
        let tx = calculator().cancel(&original, Some(20)).unwrap();

        assert_eq!(tx.to(), Some(&NameOrAddress::Address(original.from)));
        assert_eq!(tx.value(), Some(&U256::zero()));
        assert!(tx.data().map(|d| d.is_empty()).unwrap_or(true));
        assert_eq!(tx.nonce(), Some(&U256::from(7)));
        assert_eq!(tx.gas(), Some(&U256::from(21_000)));
        assert_eq!(tx.gas_price(), Some(gwei(120)));
    }

    #[test]
    fn test_legacy_speed_up_stays_legacy() {
        let tx = calculator().speed_up(&legacy(), Some(10)).unwrap();
        assert!(matches!(tx, TypedTransaction::Legacy(_)));
        assert_eq!(tx.gas_price(), Some(gwei(22)));
    }

    #[test]
    fn test_bump_below_minimum_reports_required_fee() {
        let err = calculator().speed_up(&contract_call(), Some(5)).unwrap_err();
        assert_eq!(err.kind(), "replacement_underpriced");
        assert!(err.to_string().contains("110000000000"));
    }

    #[test]
    fn test_minimum_bump_always_satisfies_network_rule() {
        let calculator = calculator();
        for fee in [1u64, 7, 999, 1_000_000_001, 123_456_789_123] {
            let mut original = pending_tx(1, 1, Utc::now());
            original.max_fee_per_gas = U256::from(fee);
            original.max_priority_fee_per_gas = Some(U256::from(fee));

            let bumped = calculator.bumped_fees(&original, 10).unwrap();
            assert!(bumped.max_fee_per_gas * 100 >= U256::from(fee) * 110);
            assert!(bumped.max_priority_fee_per_gas.unwrap() * 100 >= U256::from(fee) * 110);
            assert!(calculator
                .validate(&original, bumped.max_fee_per_gas, bumped.max_priority_fee_per_gas)
                .valid);
        }
    }

    #[test]
    fn test_validate_rejects_underpriced_with_minimum() {
        let original = contract_call();
        let result = calculator().validate(&original, gwei(109), Some(gwei(3)));
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("110000000000"));

        let result = calculator().validate(&original, gwei(110), Some(gwei(2)));
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("maxPriorityFeePerGas"));

        let result = calculator().validate(&original, gwei(110), Some(U256::from(2_200_000_000u64)));
        assert!(result.valid);
        assert!(result.warning.is_none());
    }

    #[test]
    fn test_validate_warns_then_caps() {
        let original = contract_call();
        let warned = calculator().validate(&original, gwei(800), Some(gwei(3)));
        assert!(warned.valid);
        assert!(warned.warning.is_some());

        let capped = calculator().validate(&original, gwei(6_000), Some(gwei(3)));
        assert!(!capped.valid);
        assert!(capped.error.unwrap().contains("hard cap"));
    }

    #[test]
    fn test_presets_follow_busier_network() {
        let original = contract_call();
        let network = FeeData {
            gas_price: Some(gwei(150)),
            max_fee_per_gas: Some(gwei(200)),
            max_priority_fee_per_gas: Some(gwei(5)),
        };
        let presets = calculator().presets(&original, &network);

        assert_eq!(presets.slow.max_fee_per_gas, gwei(220));
        assert_eq!(presets.market.max_fee_per_gas, gwei(230));
        assert_eq!(presets.fast.max_fee_per_gas, gwei(260));
        assert_eq!(presets.slow.max_priority_fee_per_gas, Some(U256::from(5_500_000_000u64)));
        assert_eq!(presets.fast.bump_percent, 30);
    }

    #[test]
    fn test_legacy_presets_use_network_gas_price() {
        let network = FeeData {
            gas_price: Some(gwei(30)),
            max_fee_per_gas: Some(gwei(400)),
            max_priority_fee_per_gas: Some(gwei(2)),
        };
        let presets = calculator().presets(&legacy(), &network);

        assert_eq!(presets.slow.max_fee_per_gas, gwei(33));
        assert_eq!(presets.fast.max_fee_per_gas, gwei(39));
        assert_eq!(presets.slow.max_priority_fee_per_gas, None);
        assert!(!presets.fast.exceeds_warning_threshold);
    }

    #[test]
    fn test_oversized_bump_is_rejected() {
        let calculator = calculator();
        let err = calculator.speed_up(&contract_call(), Some(u64::MAX)).unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = calculator.bumped_fees(&legacy(), MAX_BUMP_PERCENT + 1).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(calculator.bumped_fees(&legacy(), MAX_BUMP_PERCENT).is_ok());
    }

    #[test]
    fn test_presets_never_below_bumped_original() {
        let original = contract_call();
        let quiet = FeeData {
            gas_price: Some(gwei(10)),
            max_fee_per_gas: Some(gwei(12)),
            max_priority_fee_per_gas: Some(gwei(1)),
        };
        let presets = calculator().presets(&original, &quiet);

        assert_eq!(presets.slow.max_fee_per_gas, gwei(110));
        assert_eq!(presets.market.max_fee_per_gas, gwei(115));
        assert!(presets.fast.max_fee_per_gas > presets.market.max_fee_per_gas);
        assert!(!presets.fast.exceeds_warning_threshold);
    }
}
