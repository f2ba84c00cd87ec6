//! RPC access for one chain, rotating across the configured endpoints

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RebalancerError, RebalancerResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

const GWEI: u64 = 1_000_000_000;

/// Tip used when the node offers no fee history
const DEFAULT_PRIORITY_FEE: u64 = 2 * GWEI;

/// Fee-history reward percentile used as the priority fee
const PRIORITY_PERCENTILE: f64 = 50.0;

#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Clamp every component to `cap` wei
    pub fn capped(self, cap: U256) -> Self {
        match self {
            GasPrice::Legacy(price) => GasPrice::Legacy(price.min(cap)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee_per_gas = max_fee_per_gas.min(cap);
                GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas: max_priority_fee_per_gas.min(max_fee_per_gas),
                }
            }
        }
    }
}

/// `2 * base + tip`, the usual headroom for a few full blocks
fn eip1559_from_base(base_fee: U256, priority_fee: U256) -> GasPrice {
    GasPrice::Eip1559 {
        max_fee_per_gas: base_fee * 2 + priority_fee,
        max_priority_fee_per_gas: priority_fee,
    }
}

pub struct ChainProvider {
    config: ChainConfig,
    endpoints: Vec<Provider<Http>>,
    active: AtomicUsize,
}

impl ChainProvider {
    pub async fn new(config: ChainConfig) -> RebalancerResult<Self> {
        let mut endpoints = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    endpoints.push(provider.interval(Duration::from_millis(100)));
                    debug!("Chain {} endpoint {}", config.chain_id, url);
                }
                Err(e) => warn!("Skipping RPC url {} for chain {}: {}", url, config.chain_id, e),
            }
        }

        if endpoints.is_empty() {
            return Err(RebalancerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            endpoints,
            active: AtomicUsize::new(0),
        })
    }

    /// The endpoint currently in use
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.active.load(Ordering::Relaxed);
        &self.endpoints[idx % self.endpoints.len()]
    }

    pub fn failover(&self) {
        let next = (self.active.load(Ordering::Relaxed) + 1) % self.endpoints.len();
        self.active.store(next, Ordering::Relaxed);
        warn!("Chain {} switched to RPC endpoint {}", self.config.chain_id, next);
    }

    /// Try `op` once per endpoint, rotating after each failure. The last
    /// error is mapped with `on_error`.
    async fn with_failover<T, F, Fut>(
        &self,
        what: &str,
        op: F,
        on_error: impl FnOnce(ProviderError) -> RebalancerError,
    ) -> RebalancerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last = None;
        for _ in 0..self.endpoints.len() {
            match op(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} failed on chain {}: {}", what, self.config.chain_id, e);
                    last = Some(e);
                    self.failover();
                }
            }
        }

        match last {
            Some(e) => Err(on_error(e)),
            None => Err(self.connection_error(format!("{}: no endpoints", what))),
        }
    }

    fn connection_error(&self, message: impl ToString) -> RebalancerError {
        RebalancerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.to_string(),
        }
    }

    pub async fn get_block_number(&self) -> RebalancerResult<u64> {
        self.with_failover(
            "eth_blockNumber",
            |p| async move { p.get_block_number().await },
            |e| self.connection_error(e),
        )
        .await
        .map(|n| n.as_u64())
    }

    /// `eth_call` against the latest block
    pub async fn call(&self, tx: &TypedTransaction) -> RebalancerResult<Bytes> {
        self.with_failover(
            "eth_call",
            |p| async move { p.call(tx, None).await },
            |e| self.connection_error(e),
        )
        .await
    }

    pub async fn get_native_balance(&self, address: Address) -> RebalancerResult<U256> {
        self.with_failover(
            "eth_getBalance",
            |p| async move { p.get_balance(address, None).await },
            |e| self.connection_error(e),
        )
        .await
    }

    pub async fn get_transaction_receipt(&self, tx_hash: H256) -> RebalancerResult<Option<TransactionReceipt>> {
        self.with_failover(
            "eth_getTransactionReceipt",
            |p| async move { p.get_transaction_receipt(tx_hash).await },
            |e| self.connection_error(e),
        )
        .await
    }

    /// Pending-block nonce of `address`
    pub async fn get_transaction_count(&self, address: Address) -> RebalancerResult<u64> {
        let chain_id = self.config.chain_id;
        self.with_failover(
            "eth_getTransactionCount",
            |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            },
            |e| RebalancerError::Nonce {
                chain_id,
                message: e.to_string(),
            },
        )
        .await
        .map(|n| n.as_u64())
    }

    /// Reverts surface here, so they are not retried on other endpoints
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RebalancerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| RebalancerError::GasEstimation(e.to_string()))
    }

    /// Current price per the chain's gas strategy, capped at `max_gas_price_gwei`
    pub async fn get_gas_price(&self) -> RebalancerResult<GasPrice> {
        let price = match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                // Arbitrum ignores the tip and charges the L2 base fee
                let price = self
                    .with_failover(
                        "eth_gasPrice",
                        |p| async move { p.get_gas_price().await },
                        |e| RebalancerError::GasEstimation(e.to_string()),
                    )
                    .await?;
                GasPrice::Legacy(price)
            }
            GasPriceStrategy::Eip1559 => {
                let base_fee = self.latest_base_fee().await?;
                eip1559_from_base(base_fee, self.priority_fee().await)
            }
            GasPriceStrategy::Optimism => {
                // OP stack tips are tiny; the sequencer orders by fee anyway
                let base_fee = self.latest_base_fee().await?;
                let tip = self.priority_fee().await.min(U256::from(GWEI / 1_000));
                eip1559_from_base(base_fee, tip)
            }
        };
        Ok(price.capped(self.max_gas_price()))
    }

    async fn latest_base_fee(&self) -> RebalancerResult<U256> {
        let block = self
            .with_failover(
                "eth_getBlockByNumber",
                |p| async move { p.get_block(BlockNumber::Latest).await },
                |e| RebalancerError::GasEstimation(e.to_string()),
            )
            .await?
            .ok_or_else(|| RebalancerError::GasEstimation("No latest block".to_string()))?;

        block
            .base_fee_per_gas
            .ok_or_else(|| RebalancerError::GasEstimation("No base fee in block".to_string()))
    }

    /// Median tip of recent blocks, or a fixed default
    async fn priority_fee(&self) -> U256 {
        let history = self
            .http()
            .fee_history(5u64, BlockNumber::Latest, &[PRIORITY_PERCENTILE])
            .await;
        match history {
            Ok(history) => {
                let mut tips: Vec<U256> = history.reward.iter().filter_map(|r| r.first().copied()).collect();
                tips.sort();
                tips.get(tips.len() / 2)
                    .copied()
                    .unwrap_or_else(|| U256::from(DEFAULT_PRIORITY_FEE))
            }
            Err(e) => {
                debug!("eth_feeHistory unavailable on chain {}: {}", self.config.chain_id, e);
                U256::from(DEFAULT_PRIORITY_FEE)
            }
        }
    }

    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(GWEI)
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }
}
