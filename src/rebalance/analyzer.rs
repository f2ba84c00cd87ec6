//! Balance analysis against min/target thresholds
//!
//! Pure functions: every comparison happens after normalizing to
//! [`BASE_DECIMALS`](super::types::BASE_DECIMALS) so a 6-decimal stablecoin
//! and an 18-decimal one rank on the same scale.

use super::types::{normalize, TokenAnalysis, TokenPosition, TokenStatus};

use ethers::types::{Address, I256};
use std::collections::BTreeMap;

pub fn analyze(position: TokenPosition) -> TokenAnalysis {
    let current = normalize(position.current_balance, position.decimals);
    let min = normalize(position.min_balance, position.decimals);
    let target = normalize(position.target_balance, position.decimals);

    let status = if current < min {
        TokenStatus::BelowMin
    } else if current > target {
        TokenStatus::AboveTarget
    } else {
        TokenStatus::InRange
    };

    TokenAnalysis {
        delta_from_target: I256::from_raw(current) - I256::from_raw(target),
        position,
        status,
    }
}

/// Analyses of one chain, largest deficit first
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAnalysis {
    /// Sum of `delta_from_target` across the group
    pub total: I256,
    pub items: Vec<TokenAnalysis>,
}

pub fn analyze_group(mut analyses: Vec<TokenAnalysis>) -> GroupAnalysis {
    let total = analyses
        .iter()
        .fold(I256::zero(), |acc, a| acc.saturating_add(a.delta_from_target));
    analyses.sort_by(|a, b| a.delta_from_target.cmp(&b.delta_from_target));
    GroupAnalysis { total, items: analyses }
}

pub fn group_by_chain(analyses: Vec<TokenAnalysis>) -> BTreeMap<u64, GroupAnalysis> {
    let mut by_chain: BTreeMap<u64, Vec<TokenAnalysis>> = BTreeMap::new();
    for analysis in analyses {
        by_chain.entry(analysis.position.chain_id).or_default().push(analysis);
    }
    by_chain
        .into_iter()
        .map(|(chain_id, items)| (chain_id, analyze_group(items)))
        .collect()
}

/// Every tracked token of one wallet
#[derive(Debug, Clone)]
pub struct WalletAnalysis {
    pub wallet: Address,
    pub items: Vec<TokenAnalysis>,
}

impl WalletAnalysis {
    pub fn new(wallet: Address, positions: Vec<TokenPosition>) -> Self {
        Self {
            wallet,
            items: positions.into_iter().map(analyze).collect(),
        }
    }

    /// Tokens under target, largest deficit first
    pub fn deficits(&self) -> Vec<&TokenAnalysis> {
        let mut deficits: Vec<_> = self.items.iter().filter(|a| a.status == TokenStatus::BelowMin).collect();
        deficits.sort_by(|a, b| b.deficit().cmp(&a.deficit()));
        deficits
    }

    /// Tokens over target, largest surplus first
    pub fn surpluses(&self) -> Vec<&TokenAnalysis> {
        let mut surpluses: Vec<_> = self
            .items
            .iter()
            .filter(|a| a.status == TokenStatus::AboveTarget)
            .collect();
        surpluses.sort_by(|a, b| b.surplus().cmp(&a.surplus()));
        surpluses
    }

    pub fn in_range(&self) -> Vec<&TokenAnalysis> {
        self.items.iter().filter(|a| a.status == TokenStatus::InRange).collect()
    }

    pub fn by_chain(&self) -> BTreeMap<u64, GroupAnalysis> {
        group_by_chain(self.items.clone())
    }
}
