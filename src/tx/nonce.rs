//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking per (wallet, chain) to avoid conflicts
//! - Resync with the chain after a rejected submission

use crate::chain::ChainProvider;
use crate::error::RebalancerResult;

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
#[derive(Default)]
struct ChainNonceState {
    /// Next nonce to hand out; `None` until first synced from chain
    current: Option<u64>,
    /// Pending transactions: nonce -> tx hash
    pending: BTreeMap<u64, String>,
}

/// Manages nonces across wallets and chains
#[derive(Default)]
pub struct NonceManager {
    state: DashMap<(Address, u64), Arc<Mutex<ChainNonceState>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, wallet: Address, chain_id: u64) -> Arc<Mutex<ChainNonceState>> {
        self.state.entry((wallet, chain_id)).or_default().clone()
    }

    fn existing(&self, wallet: Address, chain_id: u64) -> Option<Arc<Mutex<ChainNonceState>>> {
        self.state.get(&(wallet, chain_id)).map(|s| s.clone())
    }

    /// Allocate the next nonce, syncing from chain on first use
    pub async fn get_nonce(&self, wallet: Address, provider: &ChainProvider) -> RebalancerResult<u64> {
        let chain_id = provider.chain_id();
        let slot = self.slot(wallet, chain_id);
        let mut state = slot.lock().await;

        let nonce = match state.current {
            Some(nonce) => nonce,
            None => provider.get_transaction_count(wallet).await?,
        };
        state.current = Some(nonce + 1);

        debug!("Allocated nonce {} for {:?} on chain {}", nonce, wallet, chain_id);
        Ok(nonce)
    }

    /// Mark a nonce as pending with transaction hash
    pub async fn mark_pending(&self, wallet: Address, chain_id: u64, nonce: u64, tx_hash: &str) {
        if let Some(slot) = self.existing(wallet, chain_id) {
            slot.lock().await.pending.insert(nonce, tx_hash.to_string());
        }
    }

    /// Transaction mined: it and every lower nonce are no longer pending
    pub async fn confirm_tx(&self, wallet: Address, chain_id: u64, tx_hash: &str) {
        if let Some(slot) = self.existing(wallet, chain_id) {
            let mut state = slot.lock().await;
            let mined = state
                .pending
                .iter()
                .find(|(_, hash)| hash.as_str() == tx_hash)
                .map(|(nonce, _)| *nonce);
            if let Some(mined) = mined {
                state.pending.retain(|n, _| *n > mined);
            }
        }
    }

    /// Release a nonce (transaction never broadcast, can be reused)
    pub async fn release_nonce(&self, wallet: Address, chain_id: u64, nonce: u64) {
        if let Some(slot) = self.existing(wallet, chain_id) {
            let mut state = slot.lock().await;
            state.pending.remove(&nonce);

            if state.current == Some(nonce + 1) {
                state.current = Some(nonce);
            }
        }
    }

    /// Sync with on-chain state
    pub async fn sync(&self, wallet: Address, provider: &ChainProvider) -> RebalancerResult<u64> {
        let chain_id = provider.chain_id();
        let on_chain = provider.get_transaction_count(wallet).await?;

        let slot = self.slot(wallet, chain_id);
        let mut state = slot.lock().await;

        if let Some(current) = state.current {
            if on_chain > current {
                warn!(
                    "Nonce gap on chain {} for {:?}: local {}, chain {}",
                    chain_id, wallet, current, on_chain
                );
            }
        }

        state.pending.retain(|n, _| *n >= on_chain);
        state.current = match (state.pending.is_empty(), state.current) {
            (false, Some(current)) => Some(current.max(on_chain)),
            _ => Some(on_chain),
        };
        Ok(on_chain)
    }
}
