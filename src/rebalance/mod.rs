//! Liquidity rebalancing
//!
//! Periodic balance checks analyze every tracked token of a wallet, plan
//! routes from surplus into deficit, and enqueue one `rebalance` job per
//! route step, grouped by source chain. Executing a step either settles in
//! place or leaves a `check-settlement` job that polls the bridge until the
//! funds land.

pub mod analyzer;
pub mod attestation;
pub mod executor;
pub mod ledger;
pub mod pg_ledger;
pub mod planner;
pub mod quotes;
pub mod service;
pub mod types;

pub use analyzer::{analyze, analyze_group, group_by_chain, GroupAnalysis, WalletAnalysis};
pub use attestation::{AttestationMonitor, SettlementJob};
pub use executor::{RebalanceExecutor, RebalanceJobManager, SettlementPolicy};
pub use ledger::{InMemoryRebalanceLedger, LedgerEntry, RebalanceLedger, RebalanceStatus, Reservations};
pub use pg_ledger::PgRebalanceLedger;
pub use planner::RebalancePlanner;
pub use quotes::{compute_total_slippage, select_route, PartialQuoteError, QuoteAggregator, QuoteRoute, QuoteSet};
pub use service::{CheckBalancesJobManager, CheckBalancesPayload, RebalanceCheck, RebalanceService, TrackedToken};

pub const CHECK_BALANCES_JOB: &str = "check-balances";
pub const REBALANCE_JOB: &str = "rebalance";
pub const CHECK_SETTLEMENT_JOB: &str = "check-settlement";

/// Group key serializing work that touches one chain
pub fn chain_group(chain_id: u64) -> String {
    format!("chain:{}", chain_id)
}
