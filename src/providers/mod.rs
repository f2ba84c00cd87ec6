//! Rebalance providers: bridge and swap integrations
//!
//! Each provider quotes routes for the token pairs it supports, submits the
//! route's calls through the executor's signer, and for bridges that settle
//! later, reports settlement status and the calls that finalize it.

pub mod cctp;

pub use cctp::CctpProvider;

use crate::chain::{Call, TransactionSigner};
use crate::error::{RebalancerError, RebalancerResult};
use crate::rebalance::types::{AttestationRecord, RebalanceQuote, SettlementHandle, Strategy, TokenRef};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::sync::Arc;

/// What a provider's submission produced
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderExecution {
    pub tx_hash: H256,
    /// Present when funds are in flight and need a settlement monitor
    pub settlement: Option<SettlementHandle>,
}

#[async_trait]
pub trait RebalanceProvider: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Whether executions settle in a later, separately observed step
    fn is_async(&self) -> bool {
        false
    }

    fn supports(&self, token_in: &TokenRef, token_out: &TokenRef) -> bool;

    /// Route steps for moving `amount` of `token_in` into `token_out`, in order.
    /// A single-hop provider returns one step.
    async fn quote(
        &self,
        token_in: &TokenRef,
        token_out: &TokenRef,
        amount: U256,
    ) -> RebalancerResult<Vec<RebalanceQuote>>;

    async fn execute(
        &self,
        signer: &dyn TransactionSigner,
        wallet: Address,
        quote: &RebalanceQuote,
    ) -> RebalancerResult<ProviderExecution>;

    async fn check_settlement(&self, handle: &SettlementHandle) -> RebalancerResult<AttestationRecord> {
        Err(RebalancerError::Provider {
            strategy: self.strategy(),
            message: format!("no settlement tracking for {}", handle.id),
        })
    }

    /// Calls that claim a completed settlement on the destination chain.
    /// Empty when the bridge delivers on its own.
    async fn finalize(
        &self,
        _wallet: Address,
        _handle: &SettlementHandle,
        _record: &AttestationRecord,
    ) -> RebalancerResult<Vec<Call>> {
        Ok(Vec::new())
    }
}

/// Providers in registration order
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn RebalanceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn RebalanceProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn get(&self, strategy: Strategy) -> RebalancerResult<Arc<dyn RebalanceProvider>> {
        self.providers
            .iter()
            .find(|p| p.strategy() == strategy)
            .cloned()
            .ok_or(RebalancerError::UnknownStrategy(strategy))
    }

    /// Every provider able to route `token_in` into `token_out`
    pub fn supporting(&self, token_in: &TokenRef, token_out: &TokenRef) -> Vec<Arc<dyn RebalanceProvider>> {
        self.providers
            .iter()
            .filter(|p| p.supports(token_in, token_out))
            .cloned()
            .collect()
    }

    pub fn strategies(&self) -> Vec<Strategy> {
        self.providers.iter().map(|p| p.strategy()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider shared by the aggregator, executor and monitor tests

    use super::*;
    use crate::rebalance::types::{denormalize, normalize, AttestationStatus};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub struct ScriptedProvider {
        pub strategy: Strategy,
        pub asynchronous: bool,
        /// `amount_out = amount_in * out_bps / 10_000` in normalized units
        pub out_bps: u64,
        pub fee: Option<U256>,
        pub fail_quote: bool,
        pub quote_delay: Duration,
        pub cross_chain_only: bool,
        /// Claims to be asynchronous but hands back no settlement handle
        pub drop_handle: bool,
        /// Statuses returned by successive `check_settlement` calls; the last repeats
        pub settlement_script: Mutex<VecDeque<AttestationStatus>>,
        pub settlement_checks: AtomicUsize,
        pub finalize_calls: Vec<Call>,
        pub executed: Mutex<Vec<RebalanceQuote>>,
    }

    impl ScriptedProvider {
        pub fn new(strategy: Strategy, out_bps: u64) -> Self {
            Self {
                strategy,
                asynchronous: false,
                out_bps,
                fee: None,
                fail_quote: false,
                quote_delay: Duration::ZERO,
                cross_chain_only: false,
                drop_handle: false,
                settlement_script: Mutex::new(VecDeque::new()),
                settlement_checks: AtomicUsize::new(0),
                finalize_calls: Vec::new(),
                executed: Mutex::new(Vec::new()),
            }
        }

        pub fn asynchronous(mut self, script: Vec<AttestationStatus>) -> Self {
            self.asynchronous = true;
            self.settlement_script = Mutex::new(script.into());
            self
        }

        pub fn without_handle(mut self) -> Self {
            self.drop_handle = true;
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail_quote = true;
            self
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.quote_delay = delay;
            self
        }

        pub fn with_fee(mut self, fee: u64) -> Self {
            self.fee = Some(U256::from(fee));
            self
        }

        pub fn with_finalize(mut self, calls: Vec<Call>) -> Self {
            self.finalize_calls = calls;
            self
        }

        pub fn executed(&self) -> Vec<RebalanceQuote> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RebalanceProvider for ScriptedProvider {
        fn strategy(&self) -> Strategy {
            self.strategy
        }

        fn is_async(&self) -> bool {
            self.asynchronous
        }

        fn supports(&self, token_in: &TokenRef, token_out: &TokenRef) -> bool {
            !self.cross_chain_only || token_in.chain_id != token_out.chain_id
        }

        async fn quote(
            &self,
            token_in: &TokenRef,
            token_out: &TokenRef,
            amount: U256,
        ) -> RebalancerResult<Vec<RebalanceQuote>> {
            if !self.quote_delay.is_zero() {
                tokio::time::sleep(self.quote_delay).await;
            }
            if self.fail_quote {
                return Err(RebalancerError::Provider {
                    strategy: self.strategy,
                    message: "upstream unavailable".to_string(),
                });
            }
            let normalized_out = normalize(amount, token_in.decimals) * self.out_bps / 10_000u64;
            let amount_out = denormalize(normalized_out, token_out.decimals);
            let mut quote = RebalanceQuote::new(
                self.strategy,
                *token_in,
                *token_out,
                amount,
                amount_out,
                serde_json::Value::Null,
            );
            if let Some(fee) = self.fee {
                quote = quote.with_fee(fee);
            }
            Ok(vec![quote])
        }

        async fn execute(
            &self,
            signer: &dyn TransactionSigner,
            wallet: Address,
            quote: &RebalanceQuote,
        ) -> RebalancerResult<ProviderExecution> {
            let call = Call::new(quote.token_in.address, vec![0x01u8]);
            let tx_hash = signer.submit(quote.token_in.chain_id, wallet, vec![call]).await?;
            self.executed.lock().unwrap().push(quote.clone());

            let settlement = (self.asynchronous && !self.drop_handle).then(|| SettlementHandle {
                id: format!("{:?}", tx_hash),
                source_chain_id: quote.token_in.chain_id,
                destination_chain_id: quote.token_out.chain_id,
                source_tx_hash: tx_hash,
                data: serde_json::Value::Null,
            });
            Ok(ProviderExecution { tx_hash, settlement })
        }

        async fn check_settlement(&self, handle: &SettlementHandle) -> RebalancerResult<AttestationRecord> {
            self.settlement_checks.fetch_add(1, Ordering::SeqCst);
            let mut script = self.settlement_script.lock().unwrap();
            let status = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
            .unwrap_or(AttestationStatus::Pending);

            Ok(AttestationRecord {
                message_hash: handle.id.clone(),
                attestation: matches!(status, AttestationStatus::Complete).then(|| ethers::types::Bytes::from(vec![0xaau8])),
                status,
            })
        }

        async fn finalize(
            &self,
            _wallet: Address,
            _handle: &SettlementHandle,
            _record: &AttestationRecord,
        ) -> RebalancerResult<Vec<Call>> {
            Ok(self.finalize_calls.clone())
        }
    }
}
