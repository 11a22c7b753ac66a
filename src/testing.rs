//! Scripted node fakes shared by unit tests

use crate::chain::{BlockTag, ChainRpc, ConnectionManager, FeeData, RpcConnector};
use crate::config::{ChainConfig, FamilyKind, FeeConfig, Network, WalletConfig};
use crate::error::{WalletError, WalletResult};
use crate::ledger::{PendingTransaction, TxStatus};
use crate::state::{DurableStore, MemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GWEI: u64 = 1_000_000_000;

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::from(GWEI)
}

/// A node whose answers are set by the test
pub struct FakeRpc {
    url: String,
    pub down: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
    pub balance: Mutex<U256>,
    pub latest_nonce: Mutex<u64>,
    pub pending_nonce: Mutex<u64>,
    pub gas_estimate: Mutex<Option<U256>>,
    pub fee_data: Mutex<FeeData>,
    pub call_result: Mutex<Option<Bytes>>,
    pub receipts: Mutex<HashMap<H256, TransactionReceipt>>,
    pub send_errors: Mutex<VecDeque<WalletError>>,
    pub sent: Mutex<Vec<Bytes>>,
    pub estimated: Mutex<Vec<TypedTransaction>>,
    pub block_number: Mutex<u64>,
    pub calls: AtomicUsize,
    pub released: AtomicBool,
}

impl FakeRpc {
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            down: AtomicBool::new(false),
            delay: Mutex::new(None),
            balance: Mutex::new(U256::zero()),
            latest_nonce: Mutex::new(0),
            pending_nonce: Mutex::new(0),
            gas_estimate: Mutex::new(Some(U256::from(21_000))),
            fee_data: Mutex::new(FeeData {
                gas_price: Some(gwei(20)),
                max_fee_per_gas: Some(gwei(40)),
                max_priority_fee_per_gas: Some(gwei(2)),
            }),
            call_result: Mutex::new(None),
            receipts: Mutex::new(HashMap::new()),
            send_errors: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            estimated: Mutex::new(Vec::new()),
            block_number: Mutex::new(100),
            calls: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        })
    }

    pub fn failing(url: &str) -> Arc<Self> {
        let rpc = Self::new(url);
        rpc.down.store(true, Ordering::SeqCst);
        rpc
    }

    pub fn set_nonces(&self, latest: u64, pending: u64) {
        *self.latest_nonce.lock().unwrap() = latest;
        *self.pending_nonce.lock().unwrap() = pending;
    }

    pub fn add_receipt(&self, hash: H256, success: bool) {
        self.receipts
            .lock()
            .unwrap()
            .insert(hash, receipt(hash, success));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> WalletResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(WalletError::Transport {
                url: self.url.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainRpc for FakeRpc {
    fn url(&self) -> &str {
        &self.url
    }

    async fn get_balance(&self, _address: Address) -> WalletResult<U256> {
        self.enter().await?;
        Ok(*self.balance.lock().unwrap())
    }

    async fn get_transaction_count(&self, _address: Address, tag: BlockTag) -> WalletResult<u64> {
        self.enter().await?;
        Ok(match tag {
            BlockTag::Latest => *self.latest_nonce.lock().unwrap(),
            BlockTag::Pending => *self.pending_nonce.lock().unwrap(),
        })
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> WalletResult<U256> {
        self.enter().await?;
        self.estimated.lock().unwrap().push(tx.clone());
        let estimate = *self.gas_estimate.lock().unwrap();
        estimate.ok_or_else(|| WalletError::NodeRejected("execution reverted".to_string()))
    }

    async fn get_fee_data(&self) -> WalletResult<FeeData> {
        self.enter().await?;
        Ok(self.fee_data.lock().unwrap().clone())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> WalletResult<H256> {
        self.enter().await?;
        if let Some(err) = self.send_errors.lock().unwrap().pop_front() {
            // A stale nonce means someone else already used it
            if matches!(err, WalletError::NonceConflict(_)) && !err.is_already_known() {
                *self.pending_nonce.lock().unwrap() += 1;
            }
            return Err(err);
        }
        let hash = H256::from(keccak256(&raw));
        self.sent.lock().unwrap().push(raw);
        Ok(hash)
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> WalletResult<Option<TransactionReceipt>> {
        self.enter().await?;
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn call(&self, _tx: &TypedTransaction) -> WalletResult<Bytes> {
        self.enter().await?;
        let result = self.call_result.lock().unwrap().clone();
        result.ok_or_else(|| WalletError::NodeRejected("execution reverted".to_string()))
    }

    async fn get_block_number(&self) -> WalletResult<u64> {
        self.enter().await?;
        Ok(*self.block_number.lock().unwrap())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Hands out registered fakes by URL
#[derive(Default)]
pub struct FakeConnector {
    nodes: HashMap<String, Arc<FakeRpc>>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(nodes: &[Arc<FakeRpc>]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|n| (n.url().to_string(), n.clone()))
                .collect(),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl RpcConnector for FakeConnector {
    fn connect(&self, url: &str) -> WalletResult<Arc<dyn ChainRpc>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.nodes
            .get(url)
            .cloned()
            .map(|n| n as Arc<dyn ChainRpc>)
            .ok_or_else(|| WalletError::Transport {
                url: url.to_string(),
                message: "unknown host".to_string(),
            })
    }
}

pub fn receipt(hash: H256, success: bool) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: hash,
        status: Some(U64::from(u64::from(success))),
        block_number: Some(U64::from(120)),
        gas_used: Some(U256::from(21_000)),
        effective_gas_price: Some(gwei(30)),
        ..Default::default()
    }
}

pub fn evm_chain(chain_id: u64, urls: &[&str]) -> ChainConfig {
    ChainConfig {
        family: FamilyKind::Evm,
        chain_id: Some(chain_id),
        name: format!("chain-{}", chain_id),
        network: Network::Mainnet,
        rpc_urls: urls.iter().map(|u| u.to_string()).collect(),
        explorer_url: None,
        l1_fee_oracle: None,
        enabled: true,
    }
}

pub fn fast_wallet_config() -> WalletConfig {
    WalletConfig {
        request_timeout_ms: 200,
        retry_base_delay_ms: 1,
        batch_delay_ms: 1,
        confirmation_poll_ms: 10,
        ..WalletConfig::default()
    }
}

/// Connection manager over fakes for chain key `eth` (chain id 1)
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub connector: Arc<FakeConnector>,
    pub connections: Arc<ConnectionManager>,
}

impl Harness {
    pub fn new(nodes: &[Arc<FakeRpc>]) -> Self {
        let urls: Vec<&str> = nodes.iter().map(|n| n.url()).collect();
        let mut chains = HashMap::new();
        chains.insert("eth".to_string(), evm_chain(1, &urls));
        Self::with_chains(nodes, chains, fast_wallet_config())
    }

    pub fn with_chains(
        nodes: &[Arc<FakeRpc>],
        chains: HashMap<String, ChainConfig>,
        config: WalletConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(FakeConnector::new(nodes));
        let connections = Arc::new(ConnectionManager::new(
            chains,
            connector.clone(),
            store.clone() as Arc<dyn DurableStore>,
            config,
        ));
        Self {
            store,
            connector,
            connections,
        }
    }
}

pub fn fee_config() -> FeeConfig {
    FeeConfig::default()
}

pub fn address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn hash(byte: u8) -> H256 {
    H256::repeat_byte(byte)
}

/// A pending EIP-1559 transfer from `address(0xaa)` on `eth`
pub fn pending_tx(hash_byte: u8, nonce: u64, submitted_at: DateTime<Utc>) -> PendingTransaction {
    PendingTransaction {
        hash: hash(hash_byte),
        nonce,
        chain_key: "eth".to_string(),
        from: address(0xaa),
        to: Some(address(0xbb)),
        value: U256::from(1_000_000_000_000_000u64),
        data: Bytes::default(),
        gas_limit: U256::from(21_000),
        max_fee_per_gas: gwei(100),
        max_priority_fee_per_gas: Some(gwei(2)),
        submitted_at,
        last_checked_at: None,
        status: TxStatus::Pending,
        replaced_by_hash: None,
        receipt: None,
        error_reason: None,
        is_testnet: false,
    }
}
