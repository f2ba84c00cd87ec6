//! Chain module - multi-chain RPC access and the on-chain collaborators
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - The balance-reading and transaction-submitting seams used by the rebalancer
//! - An ERC-20 / native balance reader over the providers

pub mod abi;
pub mod balance;
pub mod provider;

pub use balance::EvmBalanceReader;
pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{RebalancerError, RebalancerResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// One contract call inside a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub to: Address,
    pub data: Bytes,
    #[serde(default)]
    pub value: U256,
}

impl Call {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            value: U256::zero(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

/// Mined transaction outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub success: bool,
    pub logs: Vec<ReceiptLog>,
}

/// Reads token balances; the zero address means the chain's native asset
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceReader: Send + Sync {
    async fn get_balance(&self, chain_id: u64, token: Address, wallet: Address) -> RebalancerResult<U256>;
}

/// Signs and broadcasts calls on behalf of a wallet
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Submit `calls` in order; returns the hash of the last transaction
    async fn submit(&self, chain_id: u64, wallet: Address, calls: Vec<Call>) -> RebalancerResult<H256>;

    async fn wait_for_receipt(&self, chain_id: u64, tx_hash: H256) -> RebalancerResult<TxReceipt>;
}

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by chain ID
    providers: DashMap<u64, Arc<ChainProvider>>,
}

impl ChainManager {
    /// Create a new chain manager with all configured chains
    pub async fn new(settings: &Settings) -> RebalancerResult<Self> {
        let providers = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} ({}, ID: {})",
                name, chain_config.name, chain_config.chain_id
            );

            let provider = ChainProvider::new(chain_config.clone()).await?;
            providers.insert(chain_config.chain_id, Arc::new(provider));
        }

        Ok(Self { providers })
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain_id: u64) -> RebalancerResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(RebalancerError::ChainNotFound { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let providers: Vec<_> = self
            .providers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (chain_id, provider) in providers {
            let healthy = provider.health_check().await;
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results
    }
}
