//! Configuration management for the Tesseract wallet core
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::ChainFamily;
use crate::tx::MAX_BUMP_PERCENT;

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GWEI: u64 = 1_000_000_000;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub signer: SignerConfig,
}

/// Connection, polling and retention tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub connection_cache_size: usize,
    pub failure_threshold: u32,
    pub dropped_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub confirmation_poll_ms: u64,
    pub poll_interval_secs: u64,
    pub max_pending_per_account: usize,
    pub retention_secs: u64,
    pub balance_cache_ttl_secs: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 8_000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            connection_cache_size: 16,
            failure_threshold: 3,
            dropped_timeout_secs: 30 * 60,
            confirmation_timeout_secs: 45,
            confirmation_poll_ms: 2_000,
            poll_interval_secs: 15,
            max_pending_per_account: 50,
            retention_secs: 7 * 24 * 60 * 60,
            balance_cache_ttl_secs: 15,
            batch_size: 3,
            batch_delay_ms: 200,
        }
    }
}

impl WalletConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Fee rules. Gwei-denominated thresholds are converted to wei by the accessors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub gas_limit_buffer_percent: u64,
    pub default_transfer_gas: u64,
    pub default_contract_gas: u64,
    pub cancel_gas_limit: u64,
    pub min_gas_price_gwei: u64,
    pub fee_warning_gwei: u64,
    pub fee_hard_cap_gwei: u64,
    pub min_bump_percent: u64,
    pub default_bump_percent: u64,
    pub fast_bump_percent: u64,
    pub l1_data_fee_fallback_wei: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            gas_limit_buffer_percent: 10,
            default_transfer_gas: 21_000,
            default_contract_gas: 200_000,
            cancel_gas_limit: 21_000,
            min_gas_price_gwei: 1,
            fee_warning_gwei: 500,
            fee_hard_cap_gwei: 5_000,
            min_bump_percent: 10,
            default_bump_percent: 15,
            fast_bump_percent: 30,
            l1_data_fee_fallback_wei: 50_000_000_000_000,
        }
    }
}

impl FeeConfig {
    pub fn min_gas_price(&self) -> U256 {
        U256::from(self.min_gas_price_gwei) * U256::from(GWEI)
    }

    pub fn warning_threshold(&self) -> U256 {
        U256::from(self.fee_warning_gwei) * U256::from(GWEI)
    }

    pub fn hard_cap(&self) -> U256 {
        U256::from(self.fee_hard_cap_gwei) * U256::from(GWEI)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: String::new(),
            max_connections: 5,
            min_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FamilyKind {
    Evm,
    Solana,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub family: FamilyKind,
    pub chain_id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub network: Network,
    /// Ordered by preference
    pub rpc_urls: Vec<String>,
    pub explorer_url: Option<String>,
    /// Rollup gas price oracle exposing `getL1Fee(bytes)`
    pub l1_fee_oracle: Option<Address>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ChainConfig {
    pub fn family(&self) -> ChainFamily {
        match (self.family, self.chain_id) {
            (FamilyKind::Evm, Some(chain_id)) => ChainFamily::Evm { chain_id },
            _ => ChainFamily::SolanaLike,
        }
    }

    pub fn is_testnet(&self) -> bool {
        self.network == Network::Testnet
    }

    pub fn is_rollup(&self) -> bool {
        self.l1_fee_oracle.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SignerConfig {
    pub private_key_env: Option<String>,
    pub mnemonic_env: Option<String>,
    #[serde(default)]
    pub account_index: u32,
}

impl Settings {
    /// Load settings from the file named by `TESSERACT_WALLET_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TESSERACT_WALLET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (key, chain) in &self.chains {
            if !chain.enabled {
                continue;
            }
            if chain.family == FamilyKind::Evm {
                if chain.chain_id.is_none() {
                    anyhow::bail!("EVM chain {} has no chain_id", key);
                }
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", key);
                }
            }
        }

        let fees = &self.fees;
        if fees.min_bump_percent < 10 {
            anyhow::bail!("min_bump_percent must be at least 10");
        }
        if fees.default_bump_percent < fees.min_bump_percent
            || fees.fast_bump_percent < fees.default_bump_percent
        {
            anyhow::bail!("Bump percentages must satisfy min <= default <= fast");
        }
        if fees.fast_bump_percent > MAX_BUMP_PERCENT {
            anyhow::bail!("fast_bump_percent must not exceed {}", MAX_BUMP_PERCENT);
        }
        if fees.fee_hard_cap_gwei < fees.fee_warning_gwei {
            anyhow::bail!("fee_hard_cap_gwei must not be below fee_warning_gwei");
        }
        if self.wallet.connection_cache_size == 0 || self.wallet.batch_size == 0 {
            anyhow::bail!("connection_cache_size and batch_size must be positive");
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.url.is_empty() {
            anyhow::bail!("Postgres storage requires a url");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by EVM chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<(&String, &ChainConfig)> {
        self.chains
            .iter()
            .find(|(_, c)| c.chain_id == Some(chain_id))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [wallet]
        poll_interval_secs = 5

        [fees]
        fee_warning_gwei = 300

        [chains.base]
        family = "evm"
        chain_id = 8453
        name = "Base"
        rpc_urls = ["https://mainnet.base.org", "https://base.llamarpc.com"]
        l1_fee_oracle = "0x420000000000000000000000000000000000000F"

        [chains.sepolia]
        family = "evm"
        chain_id = 11155111
        name = "Sepolia"
        network = "testnet"
        rpc_urls = ["https://rpc.sepolia.org"]

        [chains.solana]
        family = "solana"
        name = "Solana"
        rpc_urls = []
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TESSERACT_WALLET_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TESSERACT_WALLET_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.wallet.poll_interval_secs, 5);
        assert_eq!(settings.wallet.request_timeout_ms, 8_000);
        assert_eq!(settings.fees.fee_warning_gwei, 300);
        assert_eq!(settings.fees.min_bump_percent, 10);
        assert_eq!(settings.fees.min_gas_price(), U256::from(1_000_000_000u64));

        let base = &settings.chains["base"];
        assert!(base.is_rollup());
        assert_eq!(base.family(), ChainFamily::Evm { chain_id: 8453 });
        assert!(settings.chains["sepolia"].is_testnet());
        assert_eq!(settings.chains["solana"].family(), ChainFamily::SolanaLike);

        let (key, _) = settings.get_chain_by_id(11155111).unwrap();
        assert_eq!(key, "sepolia");
    }

    #[test]
    fn test_rejects_evm_chain_without_urls() {
        let raw = r#"
            [chains.broken]
            family = "evm"
            chain_id = 1
            name = "Broken"
            rpc_urls = []
        "#;
        assert!(Settings::from_toml(raw).is_err());
    }

    #[test]
    fn test_rejects_bump_below_network_minimum() {
        let raw = r#"
            [fees]
            min_bump_percent = 5

            [chains.eth]
            family = "evm"
            chain_id = 1
            name = "Ethereum"
            rpc_urls = ["https://eth.llamarpc.com"]
        "#;
        assert!(Settings::from_toml(raw).is_err());
    }

    #[test]
    fn test_rejects_oversized_fast_bump() {
        let raw = r#"
            [fees]
            fast_bump_percent = 5000

            [chains.eth]
            family = "evm"
            chain_id = 1
            name = "Ethereum"
            rpc_urls = ["https://eth.llamarpc.com"]
        "#;
        let err = Settings::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("fast_bump_percent"));
    }
}
