//! Record of rebalances from planning to settlement
//!
//! Pending rebalances reserve their `amountIn` on the source token and
//! promise `amountOut` on the destination. Balance checks apply both so a
//! transfer still in flight is not planned a second time.
//!
//! Transitions on an id the ledger has never seen are logged and ignored:
//! a settlement that outlived the ledger's memory must still complete.

use super::types::{RebalanceRequest, TokenPosition};
use crate::error::{RebalancerError, RebalancerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStatus {
    Pending,
    Completed,
    Failed,
}

impl RebalanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceStatus::Pending => "pending",
            RebalanceStatus::Completed => "completed",
            RebalanceStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> RebalancerResult<Self> {
        match s {
            "pending" => Ok(RebalanceStatus::Pending),
            "completed" => Ok(RebalanceStatus::Completed),
            "failed" => Ok(RebalanceStatus::Failed),
            other => Err(RebalancerError::Internal(format!("unknown rebalance status {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub request: RebalanceRequest,
    pub status: RebalanceStatus,
    pub error: Option<String>,
    /// Source-chain transaction already broadcast for this step
    pub submitted_tx: Option<H256>,
    pub updated_at: DateTime<Utc>,
}

/// Per-token amounts held by pending rebalances, in each token's own decimals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reservations {
    outgoing: HashMap<(u64, Address), U256>,
    incoming: HashMap<(u64, Address), U256>,
}

impl Reservations {
    pub fn reserve(&mut self, request: &RebalanceRequest) {
        let quote = &request.quote;
        let out = self
            .outgoing
            .entry((quote.token_in.chain_id, quote.token_in.address))
            .or_default();
        *out = out.saturating_add(quote.amount_in);
        let inc = self
            .incoming
            .entry((quote.token_out.chain_id, quote.token_out.address))
            .or_default();
        *inc = inc.saturating_add(quote.amount_out);
    }

    pub fn outgoing(&self, chain_id: u64, token: Address) -> U256 {
        self.outgoing.get(&(chain_id, token)).copied().unwrap_or_default()
    }

    pub fn incoming(&self, chain_id: u64, token: Address) -> U256 {
        self.incoming.get(&(chain_id, token)).copied().unwrap_or_default()
    }

    /// `balance - outgoing + incoming`
    pub fn apply(&self, mut position: TokenPosition) -> TokenPosition {
        let key = (position.chain_id, position.token_address);
        if let Some(out) = self.outgoing.get(&key) {
            position.current_balance = position.current_balance.saturating_sub(*out);
        }
        if let Some(inc) = self.incoming.get(&key) {
            position.current_balance = position.current_balance.saturating_add(*inc);
        }
        position
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }
}

#[async_trait]
pub trait RebalanceLedger: Send + Sync {
    async fn record_pending(&self, request: &RebalanceRequest) -> RebalancerResult<()>;

    /// Remember (or with `None`, forget) the broadcast transaction
    async fn record_submission(&self, id: Uuid, tx_hash: Option<H256>) -> RebalancerResult<()>;

    async fn mark_completed(&self, id: Uuid) -> RebalancerResult<()>;

    async fn mark_failed(&self, id: Uuid, reason: &str) -> RebalancerResult<()>;

    async fn get(&self, id: Uuid) -> RebalancerResult<Option<LedgerEntry>>;

    async fn reservations(&self, wallet: Address) -> RebalancerResult<Reservations>;
}

#[derive(Default)]
pub struct InMemoryRebalanceLedger {
    entries: DashMap<Uuid, LedgerEntry>,
}

impl InMemoryRebalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, id: Uuid) -> Option<RebalanceStatus> {
        self.entries.get(&id).map(|e| e.status)
    }

    fn transition(&self, id: Uuid, status: RebalanceStatus, error: Option<String>) -> RebalancerResult<()> {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            warn!("Unknown rebalance {}, ignoring {:?}", id, status);
            return Ok(());
        };
        if entry.status != RebalanceStatus::Pending {
            warn!("Rebalance {} already {:?}, ignoring {:?}", id, entry.status, status);
            return Ok(());
        }
        entry.status = status;
        entry.error = error;
        entry.updated_at = Utc::now();
        debug!("Rebalance {} is now {:?}", id, status);
        Ok(())
    }
}

#[async_trait]
impl RebalanceLedger for InMemoryRebalanceLedger {
    async fn record_pending(&self, request: &RebalanceRequest) -> RebalancerResult<()> {
        self.entries.insert(
            request.id,
            LedgerEntry {
                request: request.clone(),
                status: RebalanceStatus::Pending,
                error: None,
                submitted_tx: None,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn record_submission(&self, id: Uuid, tx_hash: Option<H256>) -> RebalancerResult<()> {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.submitted_tx = tx_hash;
                entry.updated_at = Utc::now();
            }
            None => warn!("Unknown rebalance {}, not recording submission {:?}", id, tx_hash),
        }
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid) -> RebalancerResult<()> {
        self.transition(id, RebalanceStatus::Completed, None)
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> RebalancerResult<()> {
        self.transition(id, RebalanceStatus::Failed, Some(reason.to_string()))
    }

    async fn get(&self, id: Uuid) -> RebalancerResult<Option<LedgerEntry>> {
        Ok(self.entries.get(&id).map(|e| e.clone()))
    }

    async fn reservations(&self, wallet: Address) -> RebalancerResult<Reservations> {
        let mut reservations = Reservations::default();
        for entry in self.entries.iter() {
            if entry.status == RebalanceStatus::Pending && entry.request.wallet_address == wallet {
                reservations.reserve(&entry.request);
            }
        }
        Ok(reservations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalance::types::{RebalanceQuote, Strategy, TokenRef};

    fn token(chain_id: u64) -> TokenRef {
        TokenRef {
            chain_id,
            address: Address::repeat_byte(0x0a),
            decimals: 6,
        }
    }

    fn request(wallet: Address, amount_in: u64, amount_out: u64) -> RebalanceRequest {
        RebalanceRequest::new(
            wallet,
            RebalanceQuote::new(
                Strategy::Cctp,
                token(10),
                token(8453),
                U256::from(amount_in),
                U256::from(amount_out),
                serde_json::Value::Null,
            ),
        )
    }

    fn position(chain_id: u64, balance: u64) -> TokenPosition {
        TokenPosition {
            chain_id,
            token_address: Address::repeat_byte(0x0a),
            current_balance: U256::from(balance),
            min_balance: U256::zero(),
            target_balance: U256::zero(),
            decimals: 6,
        }
    }

    #[tokio::test]
    async fn test_pending_rebalances_adjust_positions() {
        let ledger = InMemoryRebalanceLedger::new();
        let wallet = Address::repeat_byte(0x01);
        ledger.record_pending(&request(wallet, 300, 299)).await.unwrap();
        ledger
            .record_pending(&request(Address::repeat_byte(0x02), 1_000, 1_000))
            .await
            .unwrap();

        let reservations = ledger.reservations(wallet).await.unwrap();
        assert_eq!(reservations.apply(position(10, 1_000)).current_balance, U256::from(700u64));
        assert_eq!(reservations.apply(position(8453, 50)).current_balance, U256::from(349u64));
        assert_eq!(reservations.apply(position(1, 50)).current_balance, U256::from(50u64));
    }

    #[tokio::test]
    async fn test_settled_rebalances_release_reservations() {
        let ledger = InMemoryRebalanceLedger::new();
        let wallet = Address::repeat_byte(0x01);
        let done = request(wallet, 300, 300);
        let failed = request(wallet, 100, 100);
        ledger.record_pending(&done).await.unwrap();
        ledger.record_pending(&failed).await.unwrap();

        ledger.mark_completed(done.id).await.unwrap();
        ledger.mark_failed(failed.id, "reverted").await.unwrap();

        assert!(ledger.reservations(wallet).await.unwrap().is_empty());
        let entry = ledger.get(failed.id).await.unwrap().unwrap();
        assert_eq!(entry.status, RebalanceStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("reverted"));
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let ledger = InMemoryRebalanceLedger::new();
        let req = request(Address::zero(), 1, 1);
        ledger.record_pending(&req).await.unwrap();
        ledger.mark_completed(req.id).await.unwrap();
        ledger.mark_failed(req.id, "late failure").await.unwrap();

        assert_eq!(
            ledger.get(req.id).await.unwrap().unwrap().status,
            RebalanceStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_unknown_rebalance_transitions_are_ignored() {
        let ledger = InMemoryRebalanceLedger::new();
        let id = Uuid::new_v4();

        ledger.mark_completed(id).await.unwrap();
        ledger.mark_failed(id, "lost").await.unwrap();
        ledger.record_submission(id, Some(H256::repeat_byte(1))).await.unwrap();

        assert!(ledger.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submission_is_recorded_and_cleared() {
        let ledger = InMemoryRebalanceLedger::new();
        let req = request(Address::zero(), 5, 5);
        ledger.record_pending(&req).await.unwrap();

        ledger.record_submission(req.id, Some(H256::repeat_byte(7))).await.unwrap();
        assert_eq!(
            ledger.get(req.id).await.unwrap().unwrap().submitted_tx,
            Some(H256::repeat_byte(7))
        );

        ledger.record_submission(req.id, None).await.unwrap();
        assert_eq!(ledger.get(req.id).await.unwrap().unwrap().submitted_tx, None);
    }
}
