//! Signing boundary. Key material stays behind `ChainAdapter`.

use crate::chain::ChainFamily;
use crate::config::SignerConfig;
use crate::error::{WalletError, WalletResult};

use async_trait::async_trait;
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use std::fmt;
use tracing::{debug, info};

/// Signs unsigned transactions for one chain
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn family(&self) -> ChainFamily;

    fn address(&self) -> Address;

    /// Sign `tx` for `expected_chain_id` and return the raw signed envelope
    async fn sign_unsigned_tx(
        &self,
        tx: &TypedTransaction,
        expected_chain_id: u64,
    ) -> WalletResult<Bytes>;
}

/// `ChainAdapter` over an in-process secp256k1 key
#[derive(Clone)]
pub struct LocalKeyAdapter {
    wallet: LocalWallet,
    chain_id: u64,
}

impl LocalKeyAdapter {
    pub fn from_private_key(key: &str, chain_id: u64) -> WalletResult<Self> {
        let wallet = key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| WalletError::Config(format!("Invalid private key: {}", e)))?;
        Ok(Self { wallet, chain_id })
    }

    pub fn from_mnemonic(phrase: &str, index: u32, chain_id: u64) -> WalletResult<Self> {
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(phrase.trim())
            .index(index)
            .map_err(|e| WalletError::Config(format!("Invalid derivation index: {}", e)))?
            .build()
            .map_err(|e| WalletError::Config(format!("Invalid mnemonic: {}", e)))?;
        Ok(Self { wallet, chain_id })
    }

    /// Load key material from the environment variables named in config
    pub fn from_config(config: &SignerConfig, chain_id: u64) -> WalletResult<Self> {
        if let Some(var) = &config.private_key_env {
            if let Ok(key) = std::env::var(var) {
                return Self::from_private_key(&key, chain_id);
            }
        }

        if let Some(var) = &config.mnemonic_env {
            if let Ok(phrase) = std::env::var(var) {
                return Self::from_mnemonic(&phrase, config.account_index, chain_id);
            }
        }

        Err(WalletError::Config(
            "No signer configured. Set the private key or mnemonic environment variable"
                .to_string(),
        ))
    }

    /// The same key bound to another chain
    pub fn for_chain(&self, chain_id: u64) -> Self {
        Self {
            wallet: self.wallet.clone(),
            chain_id,
        }
    }
}

impl fmt::Debug for LocalKeyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyAdapter")
            .field("address", &self.wallet.address())
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChainAdapter for LocalKeyAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm {
            chain_id: self.chain_id,
        }
    }

    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_unsigned_tx(
        &self,
        tx: &TypedTransaction,
        expected_chain_id: u64,
    ) -> WalletResult<Bytes> {
        if expected_chain_id != self.chain_id {
            return Err(WalletError::ChainIdMismatch {
                expected: self.chain_id,
                actual: expected_chain_id,
            });
        }

        let mut tx = tx.clone();
        match tx.chain_id().map(|id| id.as_u64()) {
            Some(actual) if actual != expected_chain_id => {
                return Err(WalletError::ChainIdMismatch {
                    expected: expected_chain_id,
                    actual,
                });
            }
            Some(_) => {}
            None => {
                tx.set_chain_id(expected_chain_id);
            }
        }

        let wallet = self.wallet.clone().with_chain_id(expected_chain_id);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| WalletError::Internal(format!("Failed to sign transaction: {}", e)))?;

        debug!("Signed transaction for chain {}", expected_chain_id);
        Ok(tx.rlp_signed(&signature))
    }
}

/// Log the signer address without exposing key material
pub fn describe(adapter: &dyn ChainAdapter) {
    info!(
        "Signer {:?} ready for {:?}",
        adapter.address(),
        adapter.family()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::TransactionRequest;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

    fn expected_address() -> Address {
        "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap()
    }

    fn transfer(chain_id: Option<u64>) -> TypedTransaction {
        let mut request = TransactionRequest::new()
            .to(Address::repeat_byte(0xbb))
            .value(1u64)
            .gas(21_000u64)
            .gas_price(1_000_000_000u64)
            .nonce(0u64);
        if let Some(chain_id) = chain_id {
            request = request.chain_id(chain_id);
        }
        request.into()
    }

    #[test]
    fn test_key_and_mnemonic_derive_same_account() {
        let from_key = LocalKeyAdapter::from_private_key(TEST_KEY, 1).unwrap();
        let from_phrase = LocalKeyAdapter::from_mnemonic(TEST_MNEMONIC, 0, 1).unwrap();
        assert_eq!(from_key.address(), expected_address());
        assert_eq!(from_phrase.address(), expected_address());
        assert_eq!(from_key.family(), ChainFamily::Evm { chain_id: 1 });
    }

    #[test]
    fn test_bad_key_is_config_error() {
        let err = LocalKeyAdapter::from_private_key("not-a-key", 1).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_debug_output_hides_key_material() {
        let adapter = LocalKeyAdapter::from_private_key(TEST_KEY, 1).unwrap();
        let rendered = format!("{:?}", adapter);
        assert!(rendered.contains("chain_id: 1"));
        assert!(!rendered.contains(TEST_KEY.trim_start_matches("0x")));
    }

    #[tokio::test]
    async fn test_signs_for_expected_chain() {
        let adapter = LocalKeyAdapter::from_private_key(TEST_KEY, 1).unwrap();
        let raw = adapter.sign_unsigned_tx(&transfer(None), 1).await.unwrap();
        assert!(!raw.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_transaction_for_other_chain() {
        let adapter = LocalKeyAdapter::from_private_key(TEST_KEY, 1).unwrap();

        let err = adapter
            .sign_unsigned_tx(&transfer(Some(10)), 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WalletError::ChainIdMismatch {
                expected: 1,
                actual: 10
            }
        );

        let err = adapter
            .sign_unsigned_tx(&transfer(None), 5)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "chain_id_mismatch");
    }

    #[tokio::test]
    async fn test_for_chain_rebinds() {
        let adapter = LocalKeyAdapter::from_private_key(TEST_KEY, 1).unwrap().for_chain(10);
        assert!(adapter.sign_unsigned_tx(&transfer(Some(10)), 10).await.is_ok());
    }
}
