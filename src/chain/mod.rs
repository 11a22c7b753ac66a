//! Chain module - node access for account-based chains
//!
//! This module provides:
//! - The `ChainRpc` surface consumed by the transaction core, backed by ethers HTTP providers
//! - Multi-RPC connection management with health tracking and automatic failover
//! - A TTL balance cache with in-flight request de-duplication
//! - Bounded-parallel batching for rate-limited public endpoints

pub mod batch;
pub mod cache;
pub mod connection;
pub mod rpc;

pub use cache::BalanceCache;
pub use connection::{ConnectionManager, EndpointHealth};
pub use rpc::{BlockTag, ChainRpc, EthersConnector, EthersRpc, FeeData, RpcConnector};

use serde::{Deserialize, Serialize};

/// Chain family consumed uniformly by lookups and the signing adapter boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainFamily {
    Evm { chain_id: u64 },
    SolanaLike,
}

impl ChainFamily {
    pub fn evm_chain_id(&self) -> Option<u64> {
        match self {
            ChainFamily::Evm { chain_id } => Some(*chain_id),
            ChainFamily::SolanaLike => None,
        }
    }
}
