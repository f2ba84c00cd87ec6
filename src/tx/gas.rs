//! Gas limit and price selection for submitted calls

use crate::chain::{ChainProvider, GasPrice};
use crate::error::RebalancerResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Adds headroom to node estimates. Percentages are on top of the estimate.
pub struct GasEstimator {
    limit_buffer_percent: u64,
    price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            limit_buffer_percent: 20,
            price_buffer_percent: 10,
        }
    }

    pub async fn estimate_gas_limit(&self, provider: &ChainProvider, tx: &TypedTransaction) -> RebalancerResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(self.buffer_limit(estimate))
    }

    pub fn buffer_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.limit_buffer_percent / 100
    }

    /// Buffered price, still within the chain's configured cap
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> RebalancerResult<GasPrice> {
        let quoted = provider.get_gas_price().await?;
        let price = self.buffer_price(&quoted).capped(provider.max_gas_price());
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), price);
        Ok(price)
    }

    fn buffer_price(&self, price: &GasPrice) -> GasPrice {
        let scale = |v: U256| v + v * self.price_buffer_percent / 100;
        match price {
            GasPrice::Legacy(p) => GasPrice::Legacy(scale(*p)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: scale(*max_fee_per_gas),
                max_priority_fee_per_gas: scale(*max_priority_fee_per_gas),
            },
        }
    }

    /// Worst-case wei spent on gas plus the value transferred
    pub fn max_cost(gas_limit: U256, price: &GasPrice, value: U256) -> U256 {
        let per_gas = match price {
            GasPrice::Legacy(p) => *p,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        };
        gas_limit.saturating_mul(per_gas).saturating_add(value)
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}
