//! RPC surface for EVM nodes and its ethers-backed implementation

use crate::error::{WalletError, WalletResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default tip when the node does not answer `eth_maxPriorityFeePerGas`
const FALLBACK_PRIORITY_FEE_WEI: u64 = 1_500_000_000;

/// Block tag for nonce reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// Confirmed state
    Latest,
    /// Mempool-inclusive state
    Pending,
}

impl From<BlockTag> for BlockId {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Latest => BlockId::Number(BlockNumber::Latest),
            BlockTag::Pending => BlockId::Number(BlockNumber::Pending),
        }
    }
}

/// Current network fee data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeeData {
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

impl FeeData {
    pub fn supports_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some() && self.max_priority_fee_per_gas.is_some()
    }
}

/// A live connection to one node
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn url(&self) -> &str;

    async fn get_balance(&self, address: Address) -> WalletResult<U256>;

    async fn get_transaction_count(&self, address: Address, tag: BlockTag) -> WalletResult<u64>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> WalletResult<U256>;

    async fn get_fee_data(&self) -> WalletResult<FeeData>;

    async fn send_raw_transaction(&self, raw: Bytes) -> WalletResult<H256>;

    async fn get_transaction_receipt(&self, hash: H256)
        -> WalletResult<Option<TransactionReceipt>>;

    async fn call(&self, tx: &TypedTransaction) -> WalletResult<Bytes>;

    async fn get_block_number(&self) -> WalletResult<u64>;

    /// Release any resources held by the handle. Called on cache eviction and teardown.
    fn release(&self) {}
}

/// Opens connection handles for endpoint URLs
pub trait RpcConnector: Send + Sync {
    fn connect(&self, url: &str) -> WalletResult<Arc<dyn ChainRpc>>;
}

/// `ChainRpc` over an ethers HTTP provider
pub struct EthersRpc {
    url: String,
    provider: Provider<Http>,
}

impl EthersRpc {
    pub fn new(url: &str) -> WalletResult<Self> {
        let provider = Provider::<Http>::try_from(url).map_err(|e| WalletError::Transport {
            url: url.to_string(),
            message: format!("invalid endpoint url: {}", e),
        })?;

        Ok(Self {
            url: url.to_string(),
            provider: provider.interval(Duration::from_millis(100)),
        })
    }

    /// Split node replies from transport failures
    fn map_err(&self, e: ProviderError) -> WalletError {
        match RpcError::as_error_response(&e) {
            Some(resp) => WalletError::from_node_message(&resp.message),
            None => WalletError::Transport {
                url: self.url.clone(),
                message: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl ChainRpc for EthersRpc {
    fn url(&self) -> &str {
        &self.url
    }

    async fn get_balance(&self, address: Address) -> WalletResult<U256> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn get_transaction_count(&self, address: Address, tag: BlockTag) -> WalletResult<u64> {
        let count = self
            .provider
            .get_transaction_count(address, Some(tag.into()))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(count.as_u64())
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> WalletResult<U256> {
        self.provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn get_fee_data(&self) -> WalletResult<FeeData> {
        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| self.map_err(e))?;

        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.map_err(e))?;

        // Pre-London chains have no base fee and only quote a legacy price
        let base_fee = match block.and_then(|b| b.base_fee_per_gas) {
            Some(base_fee) => base_fee,
            None => {
                return Ok(FeeData {
                    gas_price: Some(gas_price),
                    ..Default::default()
                })
            }
        };

        let priority_fee = match self
            .provider
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
        {
            Ok(fee) => fee,
            Err(e) => {
                debug!("{} has no eth_maxPriorityFeePerGas: {}", self.url, e);
                U256::from(FALLBACK_PRIORITY_FEE_WEI)
            }
        };

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok(FeeData {
            gas_price: Some(gas_price),
            max_fee_per_gas: Some(max_fee),
            max_priority_fee_per_gas: Some(priority_fee),
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> WalletResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(pending.tx_hash())
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> WalletResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn call(&self, tx: &TypedTransaction) -> WalletResult<Bytes> {
        self.provider
            .call(tx, None)
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn get_block_number(&self) -> WalletResult<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(block.as_u64())
    }

    fn release(&self) {
        debug!("Released HTTP provider for {}", self.url);
    }
}

/// Opens `EthersRpc` handles
#[derive(Debug, Default, Clone)]
pub struct EthersConnector;

impl RpcConnector for EthersConnector {
    fn connect(&self, url: &str) -> WalletResult<Arc<dyn ChainRpc>> {
        let rpc = EthersRpc::new(url)?;
        debug!("Opened HTTP provider for {}", url);
        Ok(Arc::new(rpc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_a_transport_error() {
        let err = EthersConnector.connect("not a url").err().unwrap();
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_node_reply_is_classified_by_message() {
        use ethers::providers::{HttpClientError, JsonRpcError};

        let rpc = EthersRpc::new("http://127.0.0.1:8545").unwrap();
        let reply = ProviderError::JsonRpcClientError(Box::new(HttpClientError::JsonRpcError(
            JsonRpcError {
                code: -32000,
                message: "nonce too low".to_string(),
                data: None,
            },
        )));
        assert_eq!(rpc.map_err(reply).kind(), "nonce_conflict");

        let dropped = rpc.map_err(ProviderError::CustomError("connection reset".to_string()));
        assert_eq!(dropped.kind(), "transport");
    }

    #[test]
    fn test_block_tags_map_to_ethers_block_ids() {
        assert_eq!(
            BlockId::from(BlockTag::Pending),
            BlockId::Number(BlockNumber::Pending)
        );
        assert_eq!(
            BlockId::from(BlockTag::Latest),
            BlockId::Number(BlockNumber::Latest)
        );
    }

    #[test]
    fn test_fee_data_requires_both_eip1559_fields() {
        let legacy = FeeData {
            gas_price: Some(U256::from(5)),
            max_fee_per_gas: Some(U256::from(10)),
            max_priority_fee_per_gas: None,
        };
        assert!(!legacy.supports_eip1559());
    }
}
