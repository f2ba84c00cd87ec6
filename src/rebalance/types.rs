//! Domain types shared by the analyzer, quote aggregator, executor and monitor

use crate::error::{RebalancerError, RebalancerResult};
use crate::queue::JobId;

use ethers::types::{Address, Bytes, H256, I256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Common precision every amount is scaled to before tokens are compared
pub const BASE_DECIMALS: u8 = 18;

/// Allowed gap between a quote's reported slippage and the one its amounts imply
pub const SLIPPAGE_TOLERANCE: f64 = 1e-4;

/// Scale a raw token amount to [`BASE_DECIMALS`]
pub fn normalize(amount: U256, decimals: u8) -> U256 {
    if decimals <= BASE_DECIMALS {
        amount.saturating_mul(U256::exp10((BASE_DECIMALS - decimals) as usize))
    } else {
        amount / U256::exp10((decimals - BASE_DECIMALS) as usize)
    }
}

/// Scale a [`BASE_DECIMALS`] amount back to the token's own precision (rounds down)
pub fn denormalize(amount: U256, decimals: u8) -> U256 {
    if decimals <= BASE_DECIMALS {
        amount / U256::exp10((BASE_DECIMALS - decimals) as usize)
    } else {
        amount.saturating_mul(U256::exp10((decimals - BASE_DECIMALS) as usize))
    }
}

/// Lossy conversion used for ratios and log output only
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .0
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

/// Bridge or swap integration that produced a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "CCTP")]
    Cctp,
    #[serde(rename = "CCTPV2")]
    CctpV2,
    LiFi,
    Squid,
    Everclear,
    WarpRoute,
    Relay,
    Stargate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Cctp => "CCTP",
            Strategy::CctpV2 => "CCTPV2",
            Strategy::LiFi => "LiFi",
            Strategy::Squid => "Squid",
            Strategy::Everclear => "Everclear",
            Strategy::WarpRoute => "WarpRoute",
            Strategy::Relay => "Relay",
            Strategy::Stargate => "Stargate",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token on a specific chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRef {
    pub chain_id: u64,
    pub address: Address,
    pub decimals: u8,
}

impl fmt::Display for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.chain_id, self.address)
    }
}

/// Balance snapshot of one token held by a wallet, with its thresholds.
///
/// All amounts are in the token's own decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPosition {
    pub chain_id: u64,
    pub token_address: Address,
    pub current_balance: U256,
    pub min_balance: U256,
    pub target_balance: U256,
    pub decimals: u8,
}

impl TokenPosition {
    pub fn token(&self) -> TokenRef {
        TokenRef {
            chain_id: self.chain_id,
            address: self.token_address,
            decimals: self.decimals,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    InRange,
    BelowMin,
    AboveTarget,
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenStatus::InRange => "IN_RANGE",
            TokenStatus::BelowMin => "BELOW_MIN",
            TokenStatus::AboveTarget => "ABOVE_TARGET",
        };
        f.write_str(s)
    }
}

/// Result of comparing a [`TokenPosition`] to its thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct TokenAnalysis {
    pub position: TokenPosition,
    /// `current - target`, in [`BASE_DECIMALS`]
    pub delta_from_target: I256,
    pub status: TokenStatus,
}

impl TokenAnalysis {
    /// Amount needed to reach target, in [`BASE_DECIMALS`]
    pub fn deficit(&self) -> U256 {
        if self.delta_from_target.is_negative() {
            self.delta_from_target.unsigned_abs()
        } else {
            U256::zero()
        }
    }

    /// Amount above target, in [`BASE_DECIMALS`]
    pub fn surplus(&self) -> U256 {
        if self.delta_from_target.is_positive() {
            self.delta_from_target.into_raw()
        } else {
            U256::zero()
        }
    }

    pub fn normalized_balance(&self) -> U256 {
        normalize(self.position.current_balance, self.position.decimals)
    }

    pub fn normalized_target(&self) -> U256 {
        normalize(self.position.target_balance, self.position.decimals)
    }
}

/// One executable step of a route offered by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceQuote {
    pub id: Uuid,
    pub strategy: Strategy,
    pub token_in: TokenRef,
    pub token_out: TokenRef,
    pub amount_in: U256,
    pub amount_out: U256,
    pub slippage: f64,
    /// Estimated gas/fee cost in the native unit of the source chain, when known
    #[serde(default)]
    pub estimated_fee: Option<U256>,
    /// Provider-private data needed at execution time
    #[serde(default)]
    pub context: serde_json::Value,
}

impl RebalanceQuote {
    /// Build a quote with slippage derived from the amounts
    pub fn new(
        strategy: Strategy,
        token_in: TokenRef,
        token_out: TokenRef,
        amount_in: U256,
        amount_out: U256,
        context: serde_json::Value,
    ) -> Self {
        let slippage = slippage_between(token_in, amount_in, token_out, amount_out);
        Self {
            id: Uuid::new_v4(),
            strategy,
            token_in,
            token_out,
            amount_in,
            amount_out,
            slippage,
            estimated_fee: None,
            context,
        }
    }

    pub fn with_fee(mut self, fee: U256) -> Self {
        self.estimated_fee = Some(fee);
        self
    }

    /// Reject quotes that cannot be executed as stated
    pub fn validate(&self) -> RebalancerResult<()> {
        let invalid = |reason: &str| RebalancerError::InvalidQuote {
            strategy: self.strategy,
            reason: reason.to_string(),
        };

        if self.amount_in.is_zero() {
            return Err(invalid("amountIn is zero"));
        }
        if self.amount_out.is_zero() {
            return Err(invalid("amountOut is zero"));
        }
        if !self.slippage.is_finite() || !(0.0..=1.0).contains(&self.slippage) {
            return Err(invalid(&format!("slippage {} outside [0, 1]", self.slippage)));
        }
        let implied = slippage_between(self.token_in, self.amount_in, self.token_out, self.amount_out);
        if (implied - self.slippage).abs() > SLIPPAGE_TOLERANCE {
            return Err(invalid(&format!(
                "reported slippage {} but amounts imply {:.6}",
                self.slippage, implied
            )));
        }
        Ok(())
    }
}

/// `1 - amountOut / amountIn` after normalizing both sides, clamped to `[0, 1]`
pub fn slippage_between(
    token_in: TokenRef,
    amount_in: U256,
    token_out: TokenRef,
    amount_out: U256,
) -> f64 {
    let amount_in = u256_to_f64(normalize(amount_in, token_in.decimals));
    let amount_out = u256_to_f64(normalize(amount_out, token_out.decimals));
    if amount_in <= 0.0 {
        return 1.0;
    }
    (1.0 - amount_out / amount_in).clamp(0.0, 1.0)
}

/// A selected quote, wrapped for execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequest {
    pub id: Uuid,
    pub wallet_address: Address,
    pub quote: RebalanceQuote,
    pub source_chain_id: u64,
}

impl RebalanceRequest {
    pub fn new(wallet_address: Address, quote: RebalanceQuote) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_address,
            source_chain_id: quote.token_in.chain_id,
            quote,
        }
    }
}

/// Identifies an in-flight cross-chain transfer awaiting settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementHandle {
    /// Message hash, intent id or similar provider identifier
    pub id: String,
    pub source_chain_id: u64,
    pub destination_chain_id: u64,
    pub source_tx_hash: H256,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum AttestationStatus {
    Pending,
    Complete,
    Failed { reason: String, permanent: bool },
}

/// Transient view of an external attestation/status service
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationRecord {
    pub message_hash: String,
    pub status: AttestationStatus,
    pub attestation: Option<Bytes>,
}

impl AttestationRecord {
    pub fn pending(message_hash: impl Into<String>) -> Self {
        Self {
            message_hash: message_hash.into(),
            status: AttestationStatus::Pending,
            attestation: None,
        }
    }

    pub fn complete(message_hash: impl Into<String>, attestation: Option<Bytes>) -> Self {
        Self {
            message_hash: message_hash.into(),
            status: AttestationStatus::Complete,
            attestation,
        }
    }
}

/// Outcome of [`crate::rebalance::RebalanceExecutor::execute`]
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Funds moved within the submitted transaction
    Settled { tx_hash: H256 },
    /// Funds in flight; a settlement monitor job was enqueued
    Pending {
        tx_hash: H256,
        handle: SettlementHandle,
        monitor_job: JobId,
    },
}

impl ExecutionResult {
    pub fn tx_hash(&self) -> H256 {
        match self {
            ExecutionResult::Settled { tx_hash } | ExecutionResult::Pending { tx_hash, .. } => {
                *tx_hash
            }
        }
    }
}
