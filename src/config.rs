//! Configuration management for the solver rebalancer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{RebalancerError, RebalancerResult};

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use ethers::utils::parse_units;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    /// Absent means jobs live in process memory only
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub rebalancer: RebalancerConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    pub wallets: Vec<WalletConfig>,
    pub tokens: Vec<TokenConfig>,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub cctp: Option<CctpConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueuesConfig {
    #[serde(default)]
    pub rebalance: QueueConfig,
    #[serde(default)]
    pub balance_checks: QueueConfig,
}

/// Tuning for one named queue and its worker pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum jobs executing at once across all groups
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// How long a job waits before retrying when its group is busy
    pub group_requeue_ms: u64,
    /// Dotted payload path used as group key when a job carries none
    pub group_key_path: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            group_requeue_ms: 1_000,
            group_key_path: None,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn group_requeue_interval(&self) -> Duration {
        Duration::from_millis(self.group_requeue_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RebalancerConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    /// Upper bound on compounded route slippage, in `[0, 1]`
    pub max_slippage: f64,
    pub quote_timeout_ms: u64,
    pub quote_concurrency: usize,
    /// Smallest trade worth quoting, in whole token units
    pub min_trade: String,
    pub settlement_poll_ms: u64,
    pub settlement_timeout_secs: u64,
    pub settlement_max_attempts: u32,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 60_000,
            max_slippage: 0.005,
            quote_timeout_ms: 15_000,
            quote_concurrency: 4,
            min_trade: "20".to_string(),
            settlement_poll_ms: 30_000,
            settlement_timeout_secs: 3_600,
            settlement_max_attempts: 5,
        }
    }
}

impl RebalancerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_millis(self.quote_timeout_ms)
    }

    pub fn settlement_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settlement_poll_ms)
    }

    /// Minimum trade in 18-decimal base units
    pub fn min_trade_base(&self) -> RebalancerResult<U256> {
        parse_amount(&self.min_trade, 18)
    }
}

/// Local-key transaction submission
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Environment variable holding the hex private key
    pub private_key_env: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub send_timeout_secs: u64,
    pub receipt_timeout_secs: u64,
    pub receipt_poll_ms: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            private_key_env: "REBALANCER_PRIVATE_KEY".to_string(),
            max_retries: 3,
            retry_delay_ms: 1_000,
            send_timeout_secs: 30,
            receipt_timeout_secs: 300,
            receipt_poll_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub address: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl WalletConfig {
    pub fn address(&self) -> RebalancerResult<Address> {
        parse_address(&self.address)
    }
}

/// A token the rebalancer keeps within bounds on every wallet
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub chain_id: u64,
    pub address: String,
    pub decimals: u8,
    #[serde(default)]
    pub symbol: Option<String>,
    /// Whole token units, e.g. "100.5"
    pub min_balance: String,
    pub target_balance: String,
}

impl TokenConfig {
    pub fn address(&self) -> RebalancerResult<Address> {
        parse_address(&self.address)
    }

    /// `(min, target)` in the token's own decimals
    pub fn thresholds(&self) -> RebalancerResult<(U256, U256)> {
        Ok((
            parse_amount(&self.min_balance, self.decimals)?,
            parse_amount(&self.target_balance, self.decimals)?,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: u64,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CctpConfig {
    pub api_url: String,
    pub chains: Vec<CctpChainConfig>,
}

/// Circle CCTP contracts and domain for one chain
#[derive(Debug, Clone, Deserialize)]
pub struct CctpChainConfig {
    pub chain_id: u64,
    pub domain: u32,
    pub usdc: String,
    pub token_messenger: String,
    pub message_transmitter: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("REBALANCER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from a TOML document, substituting `${VAR}` references
    pub fn from_toml(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

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

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        if self.wallets.is_empty() {
            anyhow::bail!("At least one wallet must be configured");
        }
        for wallet in &self.wallets {
            wallet.address()?;
        }

        if self.tokens.is_empty() {
            anyhow::bail!("At least one token must be tracked");
        }

        let r = &self.rebalancer;
        if !(0.0..=1.0).contains(&r.max_slippage) {
            anyhow::bail!("max_slippage {} must be within [0, 1]", r.max_slippage);
        }
        if r.quote_concurrency == 0 {
            anyhow::bail!("quote_concurrency must be at least 1");
        }
        r.min_trade_base()?;

        for (name, queue) in [
            ("rebalance", &self.queues.rebalance),
            ("balance_checks", &self.queues.balance_checks),
        ] {
            if queue.concurrency == 0 {
                anyhow::bail!("Queue {} needs a concurrency of at least 1", name);
            }
            if queue.max_attempts == 0 {
                anyhow::bail!("Queue {} needs max_attempts of at least 1", name);
            }
        }

        for token in &self.tokens {
            token.address()?;
            let (min, target) = token.thresholds()?;
            if min > target {
                anyhow::bail!(
                    "Token {} on chain {}: min_balance exceeds target_balance",
                    token.address,
                    token.chain_id
                );
            }
            if self.get_chain_by_id(token.chain_id).is_none() {
                tracing::warn!(
                    "Token {} references unconfigured chain {}",
                    token.address,
                    token.chain_id
                );
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

fn parse_address(value: &str) -> RebalancerResult<Address> {
    Address::from_str(value)
        .map_err(|e| RebalancerError::Config(format!("Invalid address {}: {}", value, e)))
}

fn parse_amount(value: &str, decimals: u8) -> RebalancerResult<U256> {
    parse_units(value, decimals as u32)
        .map(Into::into)
        .map_err(|e| RebalancerError::Config(format!("Invalid amount {}: {}", value, e)))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
