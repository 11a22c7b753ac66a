//! Connection manager with per-endpoint health tracking and automatic failover

use super::rpc::{ChainRpc, RpcConnector};
use super::ChainFamily;
use crate::config::{ChainConfig, WalletConfig};
use crate::error::{WalletError, WalletResult};
use crate::metrics;
use crate::state::DurableStore;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Health record for one RPC URL of one chain
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointHealth {
    pub url: String,
    pub last_latency_ms: Option<u64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl EndpointHealth {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            last_latency_ms: None,
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
        }
    }
}

/// A reusable node handle
struct CachedConnection {
    handle: Arc<dyn ChainRpc>,
    last_access_at: DateTime<Utc>,
    chain_key: String,
}

/// Executes RPC operations against the best available endpoint of a chain
pub struct ConnectionManager {
    /// Chain configurations indexed by chain key
    chains: HashMap<String, ChainConfig>,
    connector: Arc<dyn RpcConnector>,
    store: Arc<dyn DurableStore>,
    config: WalletConfig,
    /// Open handles keyed by `chain|url`
    cache: Mutex<LruCache<String, CachedConnection>>,
    /// Health rows keyed by `chain|url`
    health: DashMap<String, EndpointHealth>,
    /// Last known good URL per chain; `None` once loaded and absent
    last_good: DashMap<String, Option<String>>,
}

impl ConnectionManager {
    pub fn new(
        chains: HashMap<String, ChainConfig>,
        connector: Arc<dyn RpcConnector>,
        store: Arc<dyn DurableStore>,
        config: WalletConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.connection_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            chains,
            connector,
            store,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            health: DashMap::new(),
            last_good: DashMap::new(),
        }
    }

    /// Get chain config by key
    pub fn chain(&self, chain_key: &str) -> WalletResult<&ChainConfig> {
        self.chains
            .get(chain_key)
            .filter(|c| c.enabled)
            .ok_or_else(|| WalletError::ChainNotFound {
                chain_key: chain_key.to_string(),
            })
    }

    /// EVM chain ID for a chain key; non-EVM chains are rejected
    pub fn evm_chain_id(&self, chain_key: &str) -> WalletResult<u64> {
        match self.chain(chain_key)?.family() {
            ChainFamily::Evm { chain_id } => Ok(chain_id),
            ChainFamily::SolanaLike => Err(WalletError::Validation(format!(
                "chain {} is not an account-based EVM chain",
                chain_key
            ))),
        }
    }

    pub fn chain_keys(&self) -> Vec<String> {
        self.chains
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn wallet_config(&self) -> &WalletConfig {
        &self.config
    }

    /// Run `op` against each candidate endpoint in order until one succeeds
    pub async fn execute<T, F, Fut>(&self, chain_key: &str, op: F) -> WalletResult<T>
    where
        F: Fn(Arc<dyn ChainRpc>) -> Fut,
        Fut: Future<Output = WalletResult<T>>,
    {
        let candidates = self.candidates(chain_key).await?;
        let mut last_error: Option<WalletError> = None;

        for url in candidates {
            let handle = match self.handle_for(chain_key, &url).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Cannot open {} for chain {}: {}", url, chain_key, e);
                    self.record_failure(chain_key, &url).await;
                    last_error = Some(e);
                    continue;
                }
            };

            let started = Instant::now();
            let outcome = match timeout(self.config.request_timeout(), op(handle)).await {
                Ok(result) => result,
                Err(_) => Err(WalletError::Timeout {
                    operation: format!("RPC call to {}", url),
                }),
            };

            match outcome {
                Ok(value) => {
                    self.record_success(chain_key, &url, started.elapsed()).await;
                    return Ok(value);
                }
                Err(e) if e.is_endpoint_failure() => {
                    warn!("RPC call to {} failed for chain {}: {}", url, chain_key, e);
                    metrics::record_endpoint_failure(chain_key, &url);
                    self.record_failure(chain_key, &url).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    // The node answered; the request itself was refused
                    self.record_success(chain_key, &url, started.elapsed()).await;
                    return Err(e);
                }
            }
        }

        metrics::record_rpc_failure(chain_key);
        Err(WalletError::AllEndpointsFailed {
            chain_key: chain_key.to_string(),
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no endpoints configured".to_string()),
        })
    }

    /// Repeat the whole failover pass with exponential backoff and jitter
    pub async fn execute_with_retry<T, F, Fut>(&self, chain_key: &str, op: F) -> WalletResult<T>
    where
        F: Fn(Arc<dyn ChainRpc>) -> Fut,
        Fut: Future<Output = WalletResult<T>>,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            match self.execute(chain_key, &op).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Chain {} pass {}/{} failed, retrying in {:?}: {}",
                        chain_key,
                        attempt + 1,
                        max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(exp + jitter)
    }

    /// Ordered endpoint list with the last known good URL first
    pub async fn candidates(&self, chain_key: &str) -> WalletResult<Vec<String>> {
        self.evm_chain_id(chain_key)?;
        let mut urls = self.chain(chain_key)?.rpc_urls.clone();

        if let Some(good) = self.last_known_good(chain_key).await {
            if let Some(pos) = urls.iter().position(|u| *u == good) {
                let url = urls.remove(pos);
                urls.insert(0, url);
            }
        }

        Ok(urls)
    }

    /// Remembered last known good URL, loaded from the store on first use
    pub async fn last_known_good(&self, chain_key: &str) -> Option<String> {
        if let Some(entry) = self.last_good.get(chain_key) {
            return entry.value().clone();
        }

        let loaded = match self.store.get(&last_good_key(chain_key)).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to load last good endpoint for {}: {}", chain_key, e);
                None
            }
        };
        self.last_good.insert(chain_key.to_string(), loaded.clone());
        loaded
    }

    /// Health rows for a chain, in configured order
    pub fn endpoint_health(&self, chain_key: &str) -> WalletResult<Vec<EndpointHealth>> {
        let chain = self.chain(chain_key)?;
        Ok(chain
            .rpc_urls
            .iter()
            .map(|url| {
                self.health
                    .get(&cache_key(chain_key, url))
                    .map(|h| h.value().clone())
                    .unwrap_or_else(|| EndpointHealth::new(url))
            })
            .collect())
    }

    /// Health check: can any endpoint report a block number
    pub async fn health_check(&self, chain_key: &str) -> bool {
        match self
            .execute(chain_key, |rpc| async move { rpc.get_block_number().await })
            .await
        {
            Ok(block) => {
                debug!("Chain {} healthy at block {}", chain_key, block);
                true
            }
            Err(e) => {
                warn!("Health check failed for chain {}: {}", chain_key, e);
                false
            }
        }
    }

    async fn handle_for(&self, chain_key: &str, url: &str) -> WalletResult<Arc<dyn ChainRpc>> {
        let key = cache_key(chain_key, url);
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.get_mut(&key) {
            cached.last_access_at = Utc::now();
            return Ok(cached.handle.clone());
        }

        let handle = self.connector.connect(url)?;
        let entry = CachedConnection {
            handle: handle.clone(),
            last_access_at: Utc::now(),
            chain_key: chain_key.to_string(),
        };

        if let Some((evicted_key, evicted)) = cache.push(key.clone(), entry) {
            if evicted_key != key {
                debug!(
                    "Evicting idle connection {} for chain {} (last used {})",
                    evicted_key, evicted.chain_key, evicted.last_access_at
                );
                evicted.handle.release();
            }
        }

        Ok(handle)
    }

    async fn record_success(&self, chain_key: &str, url: &str, latency: Duration) {
        {
            let mut health = self
                .health
                .entry(cache_key(chain_key, url))
                .or_insert_with(|| EndpointHealth::new(url));
            health.last_latency_ms = Some(latency.as_millis() as u64);
            health.last_success_at = Some(Utc::now());
            health.consecutive_failures = 0;
        }

        let changed = self
            .last_good
            .get(chain_key)
            .map(|g| g.value().as_deref() != Some(url))
            .unwrap_or(true);

        if changed {
            self.last_good
                .insert(chain_key.to_string(), Some(url.to_string()));
            if let Err(e) = self.store.set(&last_good_key(chain_key), url.to_string()).await {
                warn!("Failed to persist last good endpoint for {}: {}", chain_key, e);
            }
            info!("Chain {} now prefers {}", chain_key, url);
        }
    }

    async fn record_failure(&self, chain_key: &str, url: &str) {
        let key = cache_key(chain_key, url);
        let failures = {
            let mut health = self
                .health
                .entry(key.clone())
                .or_insert_with(|| EndpointHealth::new(url));
            health.last_failure_at = Some(Utc::now());
            health.consecutive_failures += 1;
            health.consecutive_failures
        };

        if failures >= self.config.failure_threshold {
            if let Some(stale) = self.cache.lock().await.pop(&key) {
                warn!(
                    "Tearing down connection to {} after {} consecutive failures",
                    url, failures
                );
                stale.handle.release();
            }
        }
    }
}

fn cache_key(chain_key: &str, url: &str) -> String {
    format!("{}|{}", chain_key, url)
}

fn last_good_key(chain_key: &str) -> String {
    format!("endpoints:last_good:{}", chain_key)
}
