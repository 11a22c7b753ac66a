//! Tesseract Wallet - transaction lifecycle and RPC resilience core
//!
//! Sends, tracks and replaces transactions on EVM chains through a pool of
//! public RPC endpoints with health tracking and failover.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod signer;
pub mod state;
pub mod tx;
pub mod wallet;

#[cfg(test)]
mod testing;

pub use error::{WalletError, WalletResult};
pub use wallet::WalletServices;
