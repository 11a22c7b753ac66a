//! Service wiring: one instance of each wallet service, sharing a store and connections

use crate::api::AppState;
use crate::chain::{BalanceCache, ConnectionManager, RpcConnector};
use crate::config::Settings;
use crate::error::WalletResult;
use crate::ledger::{PendingLedger, Poller, Scheduler};
use crate::state::DurableStore;
use crate::tx::{GasEstimator, NonceCoordinator, ReplacementCalculator, TransactionSender};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct WalletServices {
    pub connections: Arc<ConnectionManager>,
    pub ledger: Arc<PendingLedger>,
    pub poller: Arc<Poller>,
    pub nonces: Arc<NonceCoordinator>,
    pub estimator: Arc<GasEstimator>,
    pub balances: Arc<BalanceCache>,
    pub sender: Arc<TransactionSender>,
}

impl WalletServices {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn DurableStore>,
        connector: Arc<dyn RpcConnector>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new(
            settings.chains.clone(),
            connector,
            store.clone(),
            settings.wallet.clone(),
        ));
        let ledger = Arc::new(PendingLedger::new(store, &settings.wallet));
        let poller = Arc::new(Poller::new(ledger.clone(), connections.clone(), scheduler));
        poller.install();

        let nonces = Arc::new(NonceCoordinator::new(connections.clone(), ledger.clone()));
        let estimator = Arc::new(GasEstimator::new(
            connections.clone(),
            settings.fees.clone(),
        ));
        let balances = Arc::new(BalanceCache::new(
            connections.clone(),
            Duration::from_secs(settings.wallet.balance_cache_ttl_secs),
        ));
        let sender = Arc::new(TransactionSender::new(
            connections.clone(),
            estimator.clone(),
            nonces.clone(),
            ReplacementCalculator::new(settings.fees.clone()),
            poller.clone(),
            balances.clone(),
        ));

        Self {
            connections,
            ledger,
            poller,
            nonces,
            estimator,
            balances,
            sender,
        }
    }

    /// Pick up transactions left pending by a previous run
    pub async fn start(&self) -> WalletResult<()> {
        if self.poller.resume().await? {
            info!("Poller re-armed from stored pending transactions");
        }
        Ok(())
    }

    pub fn api_state(&self) -> AppState {
        AppState {
            connections: self.connections.clone(),
            ledger: self.ledger.clone(),
            nonces: self.nonces.clone(),
        }
    }
}
