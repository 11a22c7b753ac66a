//! Error types for the Tesseract wallet core

use thiserror::Error;

/// Main error type for the wallet transaction core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WalletError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("RPC transport error on {url}: {message}")]
    Transport { url: String, message: String },

    #[error("All RPC endpoints failed for chain {chain_key}: {last_error}")]
    AllEndpointsFailed { chain_key: String, last_error: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Chain ID mismatch: transaction targets {actual}, signer expects {expected}")]
    ChainIdMismatch { expected: u64, actual: u64 },

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    #[error("Replacement {field} too low: required at least {required} wei, got {provided} wei")]
    ReplacementUnderpriced {
        field: String,
        required: String,
        provided: String,
    },

    #[error("Fee {provided} wei exceeds hard cap of {cap} wei")]
    FeeAboveCap { provided: String, cap: String },

    #[error("Transaction cannot be replaced: {reason}")]
    ReplacementNotEligible { reason: String },

    #[error("Node rejected request: {0}")]
    NodeRejected(String),

    #[error("Chain {chain_key} not found")]
    ChainNotFound { chain_key: String },

    #[error("Transaction {tx_hash} not found")]
    TransactionNotFound { tx_hash: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            WalletError::Config(_) => "config",
            WalletError::Store(_) => "store",
            WalletError::Transport { .. } | WalletError::AllEndpointsFailed { .. } => "transport",
            WalletError::Timeout { .. } => "timeout",
            WalletError::Validation(_) => "validation",
            WalletError::ChainIdMismatch { .. } => "chain_id_mismatch",
            WalletError::InsufficientFunds(_) => "insufficient_funds",
            WalletError::NonceConflict(_) => "nonce_conflict",
            WalletError::ReplacementUnderpriced { .. } => "replacement_underpriced",
            WalletError::FeeAboveCap { .. } => "fee_above_cap",
            WalletError::ReplacementNotEligible { .. } => "replacement_not_eligible",
            WalletError::NodeRejected(_) => "node_rejected",
            WalletError::ChainNotFound { .. } | WalletError::TransactionNotFound { .. } => {
                "not_found"
            }
            WalletError::Internal(_) => "internal",
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::Transport { .. }
                | WalletError::AllEndpointsFailed { .. }
                | WalletError::Timeout { .. }
        )
    }

    /// Errors that mean the endpoint itself is unhealthy and another one should be tried
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            WalletError::Transport { .. } | WalletError::Timeout { .. }
        )
    }

    /// Map a JSON-RPC error message returned by a node to the error taxonomy
    pub fn from_node_message(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("insufficient funds") || lower.contains("gas required exceeds allowance")
        {
            WalletError::InsufficientFunds(message.to_string())
        } else if lower.contains("nonce too low")
            || lower.contains("nonce too high")
            || lower.contains("already known")
            || lower.contains("known transaction")
            || lower.contains("nonce has already been used")
        {
            WalletError::NonceConflict(message.to_string())
        } else if lower.contains("replacement transaction underpriced")
            || lower.contains("transaction underpriced")
        {
            WalletError::ReplacementUnderpriced {
                field: "fee".to_string(),
                required: "unknown".to_string(),
                provided: "unknown".to_string(),
            }
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            // Public endpoints report throttling as JSON-RPC errors
            WalletError::Transport {
                url: String::new(),
                message: message.to_string(),
            }
        } else {
            WalletError::NodeRejected(message.to_string())
        }
    }

    /// Node says the transaction is already in its pool
    pub fn is_already_known(&self) -> bool {
        match self {
            WalletError::NonceConflict(message) => {
                let lower = message.to_lowercase();
                lower.contains("already known") || lower.contains("known transaction")
            }
            _ => false,
        }
    }
}

impl From<sqlx::Error> for WalletError {
    fn from(e: sqlx::Error) -> Self {
        WalletError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(e: serde_json::Error) -> Self {
        WalletError::Store(format!("serialization: {}", e))
    }
}

/// Result type for wallet operations
pub type WalletResult<T> = Result<T, WalletError>;
