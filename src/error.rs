//! Error types for the solver rebalancer

use crate::rebalance::types::Strategy;

use std::time::Duration;
use thiserror::Error;

/// Main error type for the rebalancer
#[derive(Error, Debug)]
pub enum RebalancerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction {tx_hash} reverted on chain {chain_id}")]
    Reverted { chain_id: u64, tx_hash: String },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Transaction {tx_hash} was broadcast but its outcome is unknown: {reason}")]
    UnconfirmedSubmission { tx_hash: String, reason: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Provider {strategy} error: {message}")]
    Provider { strategy: Strategy, message: String },

    #[error("No provider registered for strategy {0}")]
    UnknownStrategy(Strategy),

    #[error("Malformed quote from {strategy}: {reason}")]
    InvalidQuote { strategy: Strategy, reason: String },

    #[error("No viable quote for {token_in} -> {token_out}")]
    NoViableQuote { token_in: String, token_out: String },

    #[error("Settlement permanently failed for {handle}: {reason}")]
    SettlementInvalidated { handle: String, reason: String },

    #[error("Settlement failed for {handle}: {reason}")]
    SettlementFailed { handle: String, reason: String },

    #[error("Settlement for {handle} not observed within {elapsed_secs}s")]
    SettlementTimeout { handle: String, elapsed_secs: i64 },

    #[error("No job manager claims job '{0}'")]
    UnclaimedJob(String),

    #[error("Invalid payload for job '{job}': {message}")]
    InvalidPayload { job: String, message: String },

    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RebalancerError {
    /// Errors that can never succeed on retry
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            RebalancerError::Config(_)
                | RebalancerError::UnknownStrategy(_)
                | RebalancerError::InvalidQuote { .. }
                | RebalancerError::SettlementInvalidated { .. }
                | RebalancerError::SettlementTimeout { .. }
                | RebalancerError::UnclaimedJob(_)
                | RebalancerError::InvalidPayload { .. }
                | RebalancerError::ChainNotFound { .. }
                | RebalancerError::UnconfirmedSubmission { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RebalancerError::InsufficientBalance { .. }
                | RebalancerError::SettlementInvalidated { .. }
                | RebalancerError::SettlementTimeout { .. }
                | RebalancerError::Wallet(_)
                | RebalancerError::UnconfirmedSubmission { .. }
        )
    }
}

/// Result type for rebalancer operations
pub type RebalancerResult<T> = Result<T, RebalancerError>;

/// How a job handler ended when it did not complete.
///
/// The queue only ever looks at the variant, never at what caused it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// Cooperative yield: run again after the given duration, attempts untouched.
    #[error("delayed for {0:?}")]
    Delayed(Duration),

    /// Dead immediately, regardless of remaining attempts.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// Counted against `max_attempts`, retried with backoff.
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn delay(duration: Duration) -> Self {
        JobError::Delayed(duration)
    }

    pub fn is_delay(&self) -> bool {
        matches!(self, JobError::Delayed(_))
    }
}

impl From<RebalancerError> for JobError {
    fn from(err: RebalancerError) -> Self {
        if err.is_unrecoverable() {
            JobError::Unrecoverable(err.to_string())
        } else {
            JobError::Failed(err.to_string())
        }
    }
}
