//! Per-wallet serialized signing
//!
//! Wraps any [`TransactionSigner`] so submissions for the same
//! `(wallet, chain)` never overlap. Uses the same [`GroupGate`] the
//! dispatcher uses for job groups, keyed `wallet:<address>:<chain>`.
//! Receipt lookups pass straight through.

use crate::chain::{Call, TransactionSigner, TxReceipt};
use crate::error::RebalancerResult;
use crate::jobs::GroupGate;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct WalletGatedSigner<S> {
    inner: S,
    gate: Arc<GroupGate>,
    retry: Duration,
}

impl<S: TransactionSigner> WalletGatedSigner<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gate: GroupGate::new(),
            retry: Duration::from_millis(50),
        }
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn group_key(wallet: Address, chain_id: u64) -> String {
        format!("wallet:{:?}:{}", wallet, chain_id)
    }
}

#[async_trait]
impl<S: TransactionSigner> TransactionSigner for WalletGatedSigner<S> {
    async fn submit(&self, chain_id: u64, wallet: Address, calls: Vec<Call>) -> RebalancerResult<H256> {
        let key = Self::group_key(wallet, chain_id);
        let _permit = self.gate.acquire(&key, self.retry).await;
        debug!("Signing slot {} acquired", key);
        self.inner.submit(chain_id, wallet, calls).await
    }

    async fn wait_for_receipt(&self, chain_id: u64, tx_hash: H256) -> RebalancerResult<TxReceipt> {
        self.inner.wait_for_receipt(chain_id, tx_hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the highest number of overlapping submissions
    #[derive(Default)]
    struct SlowSigner {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TransactionSigner for SlowSigner {
        async fn submit(&self, _chain_id: u64, _wallet: Address, _calls: Vec<Call>) -> RebalancerResult<H256> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(H256::zero())
        }

        async fn wait_for_receipt(&self, _chain_id: u64, tx_hash: H256) -> RebalancerResult<TxReceipt> {
            Ok(TxReceipt {
                tx_hash,
                block_number: 1,
                success: true,
                logs: vec![],
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_wallet_and_chain_submissions_serialize() {
        let signer = Arc::new(WalletGatedSigner::new(SlowSigner::default()).with_retry(Duration::from_millis(1)));
        let wallet = Address::repeat_byte(0x01);

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let signer = signer.clone();
                tokio::spawn(async move { signer.submit(10, wallet, vec![]).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(signer.inner.peak.load(Ordering::SeqCst), 1);
        assert_eq!(signer.gate.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_chains_proceed_in_parallel() {
        let signer = Arc::new(WalletGatedSigner::new(SlowSigner::default()).with_retry(Duration::from_millis(1)));
        let wallet = Address::repeat_byte(0x01);

        let a = {
            let signer = signer.clone();
            tokio::spawn(async move { signer.submit(10, wallet, vec![]).await })
        };
        let b = {
            let signer = signer.clone();
            tokio::spawn(async move { signer.submit(8453, wallet, vec![]).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(
            WalletGatedSigner::<SlowSigner>::group_key(wallet, 10),
            format!("wallet:{:?}:10", wallet)
        );
    }
}
