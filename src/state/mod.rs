//! Durable key-value state
//!
//! Handles:
//! - The `DurableStore` interface the ledger and connection manager persist through
//! - An in-memory backend for tests and ephemeral runs
//! - A PostgreSQL backend for the service

mod postgres;

pub use postgres::PgStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::WalletResult;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Durable key-value store. Values are JSON documents.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> WalletResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> WalletResult<()>;

    async fn remove(&self, key: &str) -> WalletResult<()>;
}

/// Read and decode a JSON value
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> WalletResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> WalletResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw).await
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> WalletResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> WalletResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> WalletResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Open the configured backend
pub async fn open_store(config: &StorageConfig) -> WalletResult<Arc<dyn DurableStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Postgres => {
            let store = PgStore::new(config).await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
    }
}
