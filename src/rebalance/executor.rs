//! Rebalance execution
//!
//! Submits one route step and, for bridges that settle later, hands the
//! settlement off to a `check-settlement` job instead of waiting on it.

use super::attestation::SettlementJob;
use super::ledger::{RebalanceLedger, RebalanceStatus};
use super::types::{ExecutionResult, RebalanceRequest};
use super::{chain_group, CHECK_SETTLEMENT_JOB, REBALANCE_JOB};
use crate::chain::{BalanceReader, Call, TransactionSigner, TxReceipt};
use crate::config::RebalancerConfig;
use crate::error::{JobError, RebalancerError, RebalancerResult};
use crate::jobs::{JobContext, JobManager};
use crate::metrics;
use crate::providers::{ProviderRegistry, RebalanceProvider};
use crate::queue::{EnqueueRequest, Job, TaskQueue};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How settlement monitor jobs are scheduled
#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl From<&RebalancerConfig> for SettlementPolicy {
    fn from(config: &RebalancerConfig) -> Self {
        Self {
            poll_interval: config.settlement_poll_interval(),
            max_attempts: config.settlement_max_attempts.max(1),
        }
    }
}

pub struct RebalanceExecutor {
    providers: ProviderRegistry,
    balances: Arc<dyn BalanceReader>,
    signer: Arc<dyn TransactionSigner>,
    ledger: Arc<dyn RebalanceLedger>,
    /// Receives settlement monitor jobs
    monitor_queue: Arc<TaskQueue>,
    policy: SettlementPolicy,
}

impl RebalanceExecutor {
    pub fn new(
        providers: ProviderRegistry,
        balances: Arc<dyn BalanceReader>,
        signer: Arc<dyn TransactionSigner>,
        ledger: Arc<dyn RebalanceLedger>,
        monitor_queue: Arc<TaskQueue>,
        policy: SettlementPolicy,
    ) -> Self {
        Self {
            providers,
            balances,
            signer,
            ledger,
            monitor_queue,
            policy,
        }
    }

    pub async fn execute(&self, request: &RebalanceRequest) -> RebalancerResult<ExecutionResult> {
        let quote = &request.quote;
        quote.validate()?;
        if request.source_chain_id != quote.token_in.chain_id {
            return Err(RebalancerError::InvalidQuote {
                strategy: quote.strategy,
                reason: format!(
                    "request source chain {} does not match tokenIn chain {}",
                    request.source_chain_id, quote.token_in.chain_id
                ),
            });
        }
        let provider = self.providers.get(quote.strategy)?;

        // an earlier step or an unrelated spend may have moved the balance
        let balance = self
            .balances
            .get_balance(quote.token_in.chain_id, quote.token_in.address, request.wallet_address)
            .await?;
        if balance < quote.amount_in {
            return Err(RebalancerError::InsufficientBalance {
                chain_id: quote.token_in.chain_id,
                have: balance.to_string(),
                need: quote.amount_in.to_string(),
            });
        }

        info!(
            "Executing rebalance {} via {}: {} {} -> {} {}",
            request.id, quote.strategy, quote.amount_in, quote.token_in, quote.amount_out, quote.token_out
        );

        let tracker = SubmissionTracker {
            inner: self.signer.as_ref(),
            ledger: self.ledger.as_ref(),
            rebalance_id: request.id,
            last: Mutex::new(None),
        };
        match self.submit_and_hand_off(request, provider.as_ref(), &tracker).await {
            Ok(result) => Ok(result),
            Err(e @ RebalancerError::Reverted { .. }) => {
                // mined and reverted, nothing moved
                self.ledger.record_submission(request.id, None).await?;
                Err(e)
            }
            Err(e) => match *tracker.last.lock().await {
                // funds may be moving; another attempt could send them twice
                Some(tx_hash) => Err(RebalancerError::UnconfirmedSubmission {
                    tx_hash: format!("{:?}", tx_hash),
                    reason: e.to_string(),
                }),
                None => Err(e),
            },
        }
    }

    async fn submit_and_hand_off(
        &self,
        request: &RebalanceRequest,
        provider: &dyn RebalanceProvider,
        signer: &SubmissionTracker<'_>,
    ) -> RebalancerResult<ExecutionResult> {
        let quote = &request.quote;
        let execution = provider.execute(signer, request.wallet_address, quote).await?;
        let receipt = signer
            .wait_for_receipt(quote.token_in.chain_id, execution.tx_hash)
            .await?;
        if !receipt.success {
            return Err(RebalancerError::Reverted {
                chain_id: quote.token_in.chain_id,
                tx_hash: format!("{:?}", execution.tx_hash),
            });
        }

        let handle = match execution.settlement {
            Some(handle) => handle,
            None if provider.is_async() => {
                return Err(RebalancerError::Provider {
                    strategy: quote.strategy,
                    message: format!("no settlement handle for {:?}", execution.tx_hash),
                });
            }
            None => {
                if let Err(e) = self.ledger.mark_completed(request.id).await {
                    warn!("Could not record settlement of rebalance {}: {}", request.id, e);
                }
                metrics::record_rebalance(quote.strategy.as_str(), "settled");
                info!("Rebalance {} settled in {:?}", request.id, execution.tx_hash);
                return Ok(ExecutionResult::Settled {
                    tx_hash: execution.tx_hash,
                });
            }
        };

        let monitor = SettlementJob {
            rebalance_id: request.id,
            wallet: request.wallet_address,
            strategy: quote.strategy,
            handle: handle.clone(),
            poll_interval_ms: self.policy.poll_interval.as_millis() as u64,
            started_at: Utc::now(),
        };
        let job = self
            .monitor_queue
            .enqueue(
                EnqueueRequest::with_payload(CHECK_SETTLEMENT_JOB, &monitor)?
                    .group(chain_group(handle.destination_chain_id))
                    .max_attempts(self.policy.max_attempts)
                    .delay(self.policy.poll_interval),
            )
            .await?;

        metrics::record_rebalance(quote.strategy.as_str(), "submitted");
        info!(
            "Rebalance {} in flight as {}; monitoring with job {}",
            request.id, handle.id, job.id
        );
        Ok(ExecutionResult::Pending {
            tx_hash: execution.tx_hash,
            handle,
            monitor_job: job.id,
        })
    }
}

/// Signer handed to providers: records every broadcast against its rebalance
struct SubmissionTracker<'a> {
    inner: &'a dyn TransactionSigner,
    ledger: &'a dyn RebalanceLedger,
    rebalance_id: Uuid,
    last: Mutex<Option<H256>>,
}

#[async_trait]
impl<'a> TransactionSigner for SubmissionTracker<'a> {
    async fn submit(&self, chain_id: u64, wallet: Address, calls: Vec<Call>) -> RebalancerResult<H256> {
        let tx_hash = self.inner.submit(chain_id, wallet, calls).await?;
        *self.last.lock().await = Some(tx_hash);
        if let Err(e) = self.ledger.record_submission(self.rebalance_id, Some(tx_hash)).await {
            warn!("Could not record {:?} for rebalance {}: {}", tx_hash, self.rebalance_id, e);
        }
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, chain_id: u64, tx_hash: H256) -> RebalancerResult<TxReceipt> {
        self.inner.wait_for_receipt(chain_id, tx_hash).await
    }
}

/// Runs `rebalance` jobs
pub struct RebalanceJobManager {
    executor: Arc<RebalanceExecutor>,
    ledger: Arc<dyn RebalanceLedger>,
}

impl RebalanceJobManager {
    pub fn new(executor: Arc<RebalanceExecutor>, ledger: Arc<dyn RebalanceLedger>) -> Self {
        Self { executor, ledger }
    }
}

#[async_trait]
impl JobManager for RebalanceJobManager {
    fn name(&self) -> &'static str {
        "rebalance-executor"
    }

    fn claims(&self, job: &Job) -> bool {
        job.name == REBALANCE_JOB
    }

    async fn process(&self, job: &Job, _ctx: &JobContext) -> Result<(), JobError> {
        let request: RebalanceRequest = job.payload_as()?;

        // redelivery after the step already went through
        if let Some(entry) = self.ledger.get(request.id).await? {
            if entry.status != RebalanceStatus::Pending {
                warn!("Rebalance {} already {:?}, skipping", request.id, entry.status);
                return Ok(());
            }
            if let Some(tx_hash) = entry.submitted_tx {
                let err = RebalancerError::UnconfirmedSubmission {
                    tx_hash: format!("{:?}", tx_hash),
                    reason: "redelivered after broadcast".to_string(),
                };
                error!("Rebalance {} needs operator attention: {}", request.id, err);
                return Err(err.into());
            }
        }

        if let Err(e) = self.executor.execute(&request).await {
            if e.should_alert() {
                error!("Rebalance {} needs operator attention: {}", request.id, e);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_failed(&self, job: &Job, _ctx: &JobContext, err: &JobError) {
        let Ok(request) = job.payload_as::<RebalanceRequest>() else {
            error!("Rebalance job {} failed with unreadable payload: {}", job.id, err);
            return;
        };
        metrics::record_rebalance(request.quote.strategy.as_str(), "failed");
        error!(
            "Rebalance {} via {} failed after {} attempt(s): {}",
            request.id, request.quote.strategy, job.attempts, err
        );
        if let Err(e) = self.ledger.mark_failed(request.id, &err.to_string()).await {
            warn!("Could not record failure of rebalance {}: {}", request.id, e);
        }
    }
}
