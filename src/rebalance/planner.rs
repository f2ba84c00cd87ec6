//! Turns a wallet analysis into rebalance requests
//!
//! Deficits are served largest first. Surplus on the same chain is tried
//! before surplus elsewhere, and planning for a deficit stops once its
//! projected balance reaches target. Each surplus is drawn down as routes are
//! chosen so two deficits never spend the same funds.

use super::analyzer::{analyze, WalletAnalysis};
use super::quotes::QuoteAggregator;
use super::types::{denormalize, normalize, RebalanceRequest, TokenAnalysis, TokenStatus};

use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RebalancePlanner {
    aggregator: Arc<QuoteAggregator>,
    /// Smallest swap worth quoting, in base units
    min_trade: U256,
}

impl RebalancePlanner {
    pub fn new(aggregator: Arc<QuoteAggregator>, min_trade: U256) -> Self {
        Self { aggregator, min_trade }
    }

    pub async fn plan(&self, analysis: &WalletAnalysis) -> Vec<RebalanceRequest> {
        let mut surpluses: Vec<TokenAnalysis> = analysis.surpluses().into_iter().cloned().collect();
        let mut requests = Vec::new();

        for deficit in analysis.deficits() {
            let token_out = deficit.position.token();
            let target = deficit.normalized_target();
            let mut projected = deficit.normalized_balance();

            // same chain first, then largest surplus
            let mut order: Vec<usize> = (0..surpluses.len()).collect();
            order.sort_by_key(|&i| {
                (
                    surpluses[i].position.chain_id != token_out.chain_id,
                    std::cmp::Reverse(surpluses[i].surplus()),
                )
            });

            for i in order {
                if projected >= target {
                    break;
                }
                let source = &surpluses[i];
                if source.status != TokenStatus::AboveTarget {
                    continue;
                }

                let swap = (target - projected).min(source.surplus());
                if swap < self.min_trade {
                    debug!(
                        "Skipping {} -> {}: {} below minimum trade",
                        source.position.token(),
                        token_out,
                        swap
                    );
                    continue;
                }
                let amount_in = denormalize(swap, source.position.decimals);
                if amount_in.is_zero() {
                    continue;
                }

                let token_in = source.position.token();
                let route = match self.aggregator.best_route(&token_in, &token_out, amount_in).await {
                    Ok(route) => route,
                    Err(e) => {
                        warn!("No route {} -> {} for {}: {}", token_in, token_out, amount_in, e);
                        continue;
                    }
                };

                info!(
                    "Planned {} route {} -> {}: {} in, {} out, slippage {:.4}",
                    route.strategy,
                    token_in,
                    token_out,
                    route.amount_in(),
                    route.amount_out(),
                    route.total_slippage()
                );

                projected = projected.saturating_add(normalize(route.amount_out(), token_out.decimals));

                let mut drawn = surpluses[i].position.clone();
                drawn.current_balance = drawn.current_balance.saturating_sub(route.amount_in());
                surpluses[i] = analyze(drawn);

                requests.extend(
                    route
                        .steps
                        .into_iter()
                        .map(|step| RebalanceRequest::new(analysis.wallet, step)),
                );
            }

            if projected < target {
                debug!(
                    "Deficit on {} still {} short of target after planning",
                    token_out,
                    target - projected
                );
            }
        }

        requests
    }
}
