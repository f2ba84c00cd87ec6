//! Quote aggregation and route selection

use super::types::{normalize, RebalanceQuote, Strategy, TokenRef};
use crate::config::RebalancerConfig;
use crate::error::{RebalancerError, RebalancerResult};
use crate::metrics;
use crate::providers::ProviderRegistry;

use ethers::types::U256;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::cmp::Ordering;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A provider's answer: one or more steps executed in order
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteRoute {
    pub strategy: Strategy,
    pub steps: Vec<RebalanceQuote>,
}

impl QuoteRoute {
    pub fn amount_in(&self) -> U256 {
        self.steps.first().map(|q| q.amount_in).unwrap_or_default()
    }

    pub fn amount_out(&self) -> U256 {
        self.steps.last().map(|q| q.amount_out).unwrap_or_default()
    }

    pub fn token_out(&self) -> Option<TokenRef> {
        self.steps.last().map(|q| q.token_out)
    }

    pub fn total_slippage(&self) -> f64 {
        let slippages: Vec<f64> = self.steps.iter().map(|q| q.slippage).collect();
        compute_total_slippage(&slippages)
    }

    /// Sum of step fees; unknown if any step leaves it out
    pub fn total_fee(&self) -> Option<U256> {
        self.steps
            .iter()
            .try_fold(U256::zero(), |acc, q| q.estimated_fee.map(|fee| acc.saturating_add(fee)))
    }

    fn normalized_out(&self) -> U256 {
        match self.steps.last() {
            Some(q) => normalize(q.amount_out, q.token_out.decimals),
            None => U256::zero(),
        }
    }
}

/// Some providers failed or timed out; the remaining routes are still usable
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} provider(s) failed to quote", failures.len())]
pub struct PartialQuoteError {
    pub failures: Vec<(Strategy, String)>,
}

#[derive(Debug, Clone)]
pub struct QuoteSet {
    pub routes: Vec<QuoteRoute>,
    pub partial: Option<PartialQuoteError>,
}

/// `1 - Π(1 - s_i)`: each step's output feeds the next step's input
pub fn compute_total_slippage(slippages: &[f64]) -> f64 {
    1.0 - slippages.iter().fold(1.0, |kept, s| kept * (1.0 - s))
}

/// Highest output among routes within `max_slippage`; ties go to the cheaper
/// route, and an unknown fee loses to any known one
pub fn select_route(routes: Vec<QuoteRoute>, max_slippage: f64) -> Option<QuoteRoute> {
    routes
        .into_iter()
        .filter(|route| {
            let slippage = route.total_slippage();
            if slippage > max_slippage {
                debug!(
                    "Rejecting {} route: slippage {:.4} above {:.4}",
                    route.strategy, slippage, max_slippage
                );
                false
            } else {
                true
            }
        })
        .max_by(|a, b| {
            a.normalized_out()
                .cmp(&b.normalized_out())
                .then_with(|| compare_fee_preference(a.total_fee(), b.total_fee()))
        })
}

/// `Greater` when `a` is the preferable fee
fn compare_fee_preference(a: Option<U256>, b: Option<U256>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

pub struct QuoteAggregator {
    providers: ProviderRegistry,
    timeout: Duration,
    concurrency: usize,
    max_slippage: f64,
}

impl QuoteAggregator {
    pub fn new(providers: ProviderRegistry, config: &RebalancerConfig) -> Self {
        Self {
            providers,
            timeout: config.quote_timeout(),
            concurrency: config.quote_concurrency.max(1),
            max_slippage: config.max_slippage,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Ask every capable provider at once, bounded by the configured
    /// concurrency. Failing providers are dropped and reported in
    /// [`QuoteSet::partial`]; only zero usable routes is an error.
    pub async fn get_quotes(&self, token_in: &TokenRef, token_out: &TokenRef, amount: U256) -> RebalancerResult<QuoteSet> {
        let no_quote = || RebalancerError::NoViableQuote {
            token_in: token_in.to_string(),
            token_out: token_out.to_string(),
        };

        let candidates = self.providers.supporting(token_in, token_out);
        if candidates.is_empty() {
            debug!("No provider supports {} -> {}", token_in, token_out);
            return Err(no_quote());
        }

        // boxed up front so the buffered stream stays Send inside job handlers
        let timeout = self.timeout;
        let pending: Vec<BoxFuture<'_, _>> = candidates
            .into_iter()
            .map(|provider| {
                async move {
                    let strategy = provider.strategy();
                    let answer = tokio::time::timeout(timeout, provider.quote(token_in, token_out, amount)).await;
                    (strategy, answer)
                }
                .boxed()
            })
            .collect();
        let answers: Vec<_> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut routes = Vec::new();
        let mut failures = Vec::new();
        for (strategy, answer) in answers {
            let outcome = match answer {
                Ok(Ok(steps)) => validate_steps(strategy, steps),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", timeout)),
            };
            match outcome {
                Ok(route) => {
                    metrics::record_quote(strategy.as_str());
                    routes.push(route);
                }
                Err(reason) => {
                    metrics::record_quote_failure(strategy.as_str());
                    warn!("Quote from {} for {} -> {} failed: {}", strategy, token_in, token_out, reason);
                    failures.push((strategy, reason));
                }
            }
        }

        if routes.is_empty() {
            return Err(no_quote());
        }

        let partial = (!failures.is_empty()).then_some(PartialQuoteError { failures });
        if let Some(partial) = &partial {
            info!("{}; continuing with {} route(s)", partial, routes.len());
        }
        Ok(QuoteSet { routes, partial })
    }

    /// Quote and select in one step
    pub async fn best_route(&self, token_in: &TokenRef, token_out: &TokenRef, amount: U256) -> RebalancerResult<QuoteRoute> {
        let set = self.get_quotes(token_in, token_out, amount).await?;
        select_route(set.routes, self.max_slippage).ok_or_else(|| RebalancerError::NoViableQuote {
            token_in: token_in.to_string(),
            token_out: token_out.to_string(),
        })
    }
}

fn validate_steps(strategy: Strategy, steps: Vec<RebalanceQuote>) -> Result<QuoteRoute, String> {
    if steps.is_empty() {
        return Err("returned no steps".to_string());
    }
    for step in &steps {
        step.validate().map_err(|e| e.to_string())?;
    }
    Ok(QuoteRoute { strategy, steps })
}
