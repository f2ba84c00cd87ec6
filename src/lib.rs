//! Solver rebalancer
//!
//! Keyed job orchestration for an intent solver plus the liquidity
//! rebalancing workflow built on it: balance checks, quote aggregation,
//! execution and settlement monitoring across chains.

pub mod chain;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod providers;
pub mod queue;
pub mod rebalance;
pub mod tx;

pub use error::{JobError, RebalancerError, RebalancerResult};
