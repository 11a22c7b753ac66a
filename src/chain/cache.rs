//! Balance read cache with TTL and in-flight request sharing

use super::batch::run_bounded;
use super::ConnectionManager;
use crate::error::WalletResult;

use dashmap::DashMap;
use ethers::types::{Address, U256};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

type SharedFetch = Shared<BoxFuture<'static, WalletResult<U256>>>;

/// Caches native balances per `(chain, address)`
pub struct BalanceCache {
    connections: Arc<ConnectionManager>,
    ttl: Duration,
    entries: DashMap<String, (U256, Instant)>,
    in_flight: DashMap<String, SharedFetch>,
}

impl BalanceCache {
    pub fn new(connections: Arc<ConnectionManager>, ttl: Duration) -> Self {
        Self {
            connections,
            ttl,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Native balance, served from cache while younger than the TTL
    pub async fn balance(&self, chain_key: &str, address: Address) -> WalletResult<U256> {
        let key = format!("{}:{:?}", chain_key, address);

        if let Some(balance) = self.fresh(&key) {
            debug!("Balance cache hit for {}", key);
            return Ok(balance);
        }

        let fetch = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| {
                let connections = self.connections.clone();
                let chain_key = chain_key.to_string();
                async move {
                    connections
                        .execute(&chain_key, |rpc| async move { rpc.get_balance(address).await })
                        .await
                }
                .boxed()
                .shared()
            })
            .clone();

        let result = fetch.await;
        self.in_flight.remove(&key);

        if let Ok(balance) = &result {
            self.entries.insert(key, (*balance, Instant::now()));
        }
        result
    }

    /// Balances for many addresses, fetched in bounded groups
    pub async fn balances(
        &self,
        chain_key: &str,
        addresses: &[Address],
    ) -> Vec<WalletResult<U256>> {
        let config = self.connections.wallet_config();
        run_bounded(
            addresses.iter().copied(),
            config.batch_size,
            config.batch_delay(),
            move |address| self.balance(chain_key, address),
        )
        .await
    }

    /// Drop a cached value, e.g. after the account sent a transaction
    pub fn invalidate(&self, chain_key: &str, address: Address) {
        self.entries.remove(&format!("{}:{:?}", chain_key, address));
    }

    fn fresh(&self, key: &str) -> Option<U256> {
        self.entries
            .get(key)
            .filter(|entry| entry.value().1.elapsed() < self.ttl)
            .map(|entry| entry.value().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{address, FakeRpc, Harness};

    #[tokio::test]
    async fn test_read_within_ttl_is_reused() {
        let node = FakeRpc::new("https://a.example");
        *node.balance.lock().unwrap() = U256::from(42);
        let harness = Harness::new(&[node.clone()]);
        let cache = BalanceCache::new(harness.connections.clone(), Duration::from_secs(60));

        assert_eq!(cache.balance("eth", address(1)).await.unwrap(), U256::from(42));
        *node.balance.lock().unwrap() = U256::from(7);
        assert_eq!(cache.balance("eth", address(1)).await.unwrap(), U256::from(42));
        assert_eq!(node.call_count(), 1);
    }

    #[tokio::test]
    async fn test_read_older_than_ttl_is_refetched() {
        let node = FakeRpc::new("https://a.example");
        let harness = Harness::new(&[node.clone()]);
        let cache = BalanceCache::new(harness.connections.clone(), Duration::from_millis(20));

        cache.balance("eth", address(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        *node.balance.lock().unwrap() = U256::from(9);
        assert_eq!(cache.balance("eth", address(1)).await.unwrap(), U256::from(9));
        assert_eq!(node.call_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_call() {
        let node = FakeRpc::new("https://a.example");
        *node.delay.lock().unwrap() = Some(Duration::from_millis(30));
        let harness = Harness::new(&[node.clone()]);
        let cache = BalanceCache::new(harness.connections.clone(), Duration::from_secs(60));

        let (a, b) = tokio::join!(
            cache.balance("eth", address(1)),
            cache.balance("eth", address(1))
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(node.call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let node = FakeRpc::new("https://a.example");
        let harness = Harness::new(&[node.clone()]);
        let cache = BalanceCache::new(harness.connections.clone(), Duration::from_secs(60));

        cache.balance("eth", address(1)).await.unwrap();
        cache.invalidate("eth", address(1));
        cache.balance("eth", address(1)).await.unwrap();
        assert_eq!(node.call_count(), 2);
    }

    #[tokio::test]
    async fn test_many_balances_in_input_order() {
        let node = FakeRpc::new("https://a.example");
        *node.balance.lock().unwrap() = U256::from(5);
        let harness = Harness::new(&[node.clone()]);
        let cache = BalanceCache::new(harness.connections.clone(), Duration::from_secs(60));

        let results = cache
            .balances("eth", &[address(1), address(2), address(3), address(4)])
            .await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.as_ref().ok() == Some(&U256::from(5))));
        assert_eq!(node.call_count(), 4);
    }
}
