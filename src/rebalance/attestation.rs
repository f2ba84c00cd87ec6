//! Settlement monitoring for bridges that deliver asynchronously
//!
//! A `check-settlement` job asks the provider for the handle's status once
//! per run. Pending yields a cooperative delay (no attempt consumed); a
//! completed attestation is finalized on the destination chain; a failed one
//! is retried unless the provider says it can never succeed. Because delays
//! never count as attempts, the job enforces its own deadline from
//! `started_at`.

use super::ledger::RebalanceLedger;
use super::types::{AttestationRecord, AttestationStatus, SettlementHandle, Strategy};
use super::CHECK_SETTLEMENT_JOB;
use crate::chain::TransactionSigner;
use crate::error::{JobError, RebalancerError, RebalancerResult};
use crate::jobs::{poll_or_delay, JobContext, JobManager, PollStatus};
use crate::metrics;
use crate::providers::ProviderRegistry;
use crate::queue::Job;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Payload of a `check-settlement` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementJob {
    pub rebalance_id: Uuid,
    pub wallet: Address,
    pub strategy: Strategy,
    pub handle: SettlementHandle,
    pub poll_interval_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl SettlementJob {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub struct AttestationMonitor {
    providers: ProviderRegistry,
    signer: Arc<dyn TransactionSigner>,
    ledger: Arc<dyn RebalanceLedger>,
    /// Longest a settlement may stay unobserved
    timeout: Duration,
}

impl AttestationMonitor {
    pub fn new(
        providers: ProviderRegistry,
        signer: Arc<dyn TransactionSigner>,
        ledger: Arc<dyn RebalanceLedger>,
        timeout: Duration,
    ) -> Self {
        Self {
            providers,
            signer,
            ledger,
            timeout,
        }
    }

    fn check_deadline(&self, job: &SettlementJob) -> RebalancerResult<()> {
        let elapsed = Utc::now().signed_duration_since(job.started_at);
        if elapsed.to_std().map(|e| e > self.timeout).unwrap_or(false) {
            return Err(RebalancerError::SettlementTimeout {
                handle: job.handle.id.clone(),
                elapsed_secs: elapsed.num_seconds(),
            });
        }
        Ok(())
    }

    /// Claim the settled funds on the destination chain, when the bridge needs it
    async fn finalize(&self, job: &SettlementJob, record: &AttestationRecord) -> RebalancerResult<()> {
        let provider = self.providers.get(job.strategy)?;
        let calls = provider.finalize(job.wallet, &job.handle, record).await?;
        if calls.is_empty() {
            return Ok(());
        }

        let chain_id = job.handle.destination_chain_id;
        let tx_hash = self.signer.submit(chain_id, job.wallet, calls).await?;
        let receipt = self.signer.wait_for_receipt(chain_id, tx_hash).await?;
        if !receipt.success {
            return Err(RebalancerError::Reverted {
                chain_id,
                tx_hash: format!("{:?}", tx_hash),
            });
        }
        info!(
            "Finalized settlement {} on chain {} in {:?}",
            job.handle.id, chain_id, tx_hash
        );
        Ok(())
    }
}

#[async_trait]
impl JobManager for AttestationMonitor {
    fn name(&self) -> &'static str {
        "attestation-monitor"
    }

    fn claims(&self, job: &Job) -> bool {
        job.name == CHECK_SETTLEMENT_JOB
    }

    async fn process(&self, job: &Job, _ctx: &JobContext) -> Result<(), JobError> {
        let settlement: SettlementJob = job.payload_as()?;
        self.check_deadline(&settlement)?;

        let provider = self.providers.get(settlement.strategy)?;
        let record = poll_or_delay(
            || async {
                let record = provider.check_settlement(&settlement.handle).await?;
                Ok::<_, RebalancerError>(match record.status {
                    AttestationStatus::Pending => {
                        debug!("Settlement {} still pending", settlement.handle.id);
                        PollStatus::Pending
                    }
                    _ => PollStatus::Ready(record),
                })
            },
            settlement.poll_interval(),
        )
        .await?;

        match &record.status {
            AttestationStatus::Complete => {
                self.finalize(&settlement, &record).await?;
                // funds landed; a ledger hiccup must not send the claim again
                if let Err(e) = self.ledger.mark_completed(settlement.rebalance_id).await {
                    warn!("Could not record settlement of rebalance {}: {}", settlement.rebalance_id, e);
                }

                let latency = Utc::now().signed_duration_since(settlement.started_at);
                metrics::record_settlement_latency(
                    settlement.strategy.as_str(),
                    latency.num_milliseconds() as f64 / 1_000.0,
                );
                metrics::record_rebalance(settlement.strategy.as_str(), "completed");
                info!(
                    "Rebalance {} settled via {} after {}s",
                    settlement.rebalance_id,
                    settlement.strategy,
                    latency.num_seconds()
                );
                Ok(())
            }
            AttestationStatus::Failed { reason, permanent: true } => {
                Err(RebalancerError::SettlementInvalidated {
                    handle: settlement.handle.id.clone(),
                    reason: reason.clone(),
                }
                .into())
            }
            AttestationStatus::Failed { reason, .. } => {
                warn!("Settlement {} reported failure: {}", settlement.handle.id, reason);
                Err(RebalancerError::SettlementFailed {
                    handle: settlement.handle.id.clone(),
                    reason: reason.clone(),
                }
                .into())
            }
            AttestationStatus::Pending => Err(JobError::delay(settlement.poll_interval())),
        }
    }

    async fn on_failed(&self, job: &Job, _ctx: &JobContext, err: &JobError) {
        let Ok(settlement) = job.payload_as::<SettlementJob>() else {
            error!("Settlement job {} failed with unreadable payload: {}", job.id, err);
            return;
        };
        metrics::record_rebalance(settlement.strategy.as_str(), "failed");
        error!(
            "Settlement {} of rebalance {} needs manual attention: {}",
            settlement.handle.id, settlement.rebalance_id, err
        );
        if let Err(e) = self.ledger.mark_failed(settlement.rebalance_id, &err.to_string()).await {
            warn!("Could not record failure of rebalance {}: {}", settlement.rebalance_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Call;
    use crate::jobs::{GroupedDispatcher, JobRegistry};
    use crate::providers::testing::ScriptedProvider;
    use crate::queue::testing::{eventually, fast_config, memory_queue, spawn_workers, wait_terminal};
    use crate::queue::{EnqueueRequest, JobState, MemoryQueueStore, QueueStore, TaskQueue};
    use crate::rebalance::ledger::{InMemoryRebalanceLedger, RebalanceStatus};
    use crate::rebalance::testing::FakeChain;
    use crate::rebalance::types::{RebalanceQuote, RebalanceRequest, TokenRef};
    use crate::rebalance::chain_group;
    use ethers::types::{H256, U256};
    use std::sync::atomic::Ordering;

    const WALLET: Address = Address::repeat_byte(0xee);

    struct Harness {
        chain: Arc<FakeChain>,
        ledger: Arc<InMemoryRebalanceLedger>,
        provider: Arc<ScriptedProvider>,
        queue: Arc<TaskQueue>,
        monitor: Arc<AttestationMonitor>,
        rebalance_id: Uuid,
    }

    async fn harness(provider: ScriptedProvider, timeout: Duration) -> Harness {
        let provider = Arc::new(provider);
        let chain = Arc::new(FakeChain::default());
        let ledger = Arc::new(InMemoryRebalanceLedger::new());
        let token = |chain_id| TokenRef {
            chain_id,
            address: Address::repeat_byte(0x0a),
            decimals: 6,
        };
        let request = RebalanceRequest::new(
            WALLET,
            RebalanceQuote::new(
                Strategy::Cctp,
                token(10),
                token(8453),
                U256::from(100u64),
                U256::from(100u64),
                serde_json::Value::Null,
            ),
        );
        ledger.record_pending(&request).await.unwrap();

        let monitor = Arc::new(AttestationMonitor::new(
            ProviderRegistry::new().register(provider.clone()),
            chain.clone(),
            ledger.clone(),
            timeout,
        ));
        Harness {
            chain,
            ledger,
            provider,
            queue: memory_queue("rebalance", fast_config(2)),
            monitor,
            rebalance_id: request.id,
        }
    }

    fn payload(h: &Harness, started_at: DateTime<Utc>) -> SettlementJob {
        SettlementJob {
            rebalance_id: h.rebalance_id,
            wallet: WALLET,
            strategy: Strategy::Cctp,
            handle: SettlementHandle {
                id: "0xmessage".to_string(),
                source_chain_id: 10,
                destination_chain_id: 8453,
                source_tx_hash: H256::repeat_byte(0x01),
                data: serde_json::Value::Null,
            },
            poll_interval_ms: 5,
            started_at,
        }
    }

    async fn enqueue(h: &Harness, payload: &SettlementJob) -> Job {
        let handle = h
            .queue
            .enqueue(
                EnqueueRequest::with_payload(CHECK_SETTLEMENT_JOB, payload)
                    .unwrap()
                    .group(chain_group(8453)),
            )
            .await
            .unwrap();
        h.queue.get(handle.id).await.unwrap().unwrap()
    }

    fn dispatcher(h: &Harness) -> Arc<GroupedDispatcher> {
        let registry = JobRegistry::new().register(h.monitor.clone());
        Arc::new(GroupedDispatcher::new(h.queue.clone(), Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_pending_attestation_delays_without_failing() {
        let h = harness(
            ScriptedProvider::new(Strategy::Cctp, 10_000).asynchronous(vec![AttestationStatus::Pending]),
            Duration::from_secs(60),
        )
        .await;
        let job = enqueue(&h, &payload(&h, Utc::now())).await;
        let ctx = JobContext { queue: h.queue.clone() };

        let result = h.monitor.process(&job, &ctx).await;

        assert_eq!(result, Err(JobError::Delayed(Duration::from_millis(5))));
        assert!(h.chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_polls_until_complete_then_finalizes() {
        let finalize = Call::new(Address::repeat_byte(0x21), vec![0x57u8, 0xec, 0xfd, 0x28]);
        let h = harness(
            ScriptedProvider::new(Strategy::Cctp, 10_000)
                .asynchronous(vec![
                    AttestationStatus::Pending,
                    AttestationStatus::Pending,
                    AttestationStatus::Complete,
                ])
                .with_finalize(vec![finalize.clone()]),
            Duration::from_secs(60),
        )
        .await;
        let job = enqueue(&h, &payload(&h, Utc::now())).await;
        let (stop, workers) = spawn_workers(h.queue.clone(), dispatcher(&h));

        let done = wait_terminal(&h.queue, job.id, Duration::from_secs(5)).await;

        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts, 0);
        assert_eq!(h.provider.settlement_checks.load(Ordering::SeqCst), 3);
        assert_eq!(h.chain.submissions(), vec![(8453, vec![finalize])]);
        assert_eq!(h.ledger.status(h.rebalance_id), Some(RebalanceStatus::Completed));

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_settlement_survives_restart_with_empty_ledger() {
        let finalize = Call::new(Address::repeat_byte(0x21), vec![0x57u8, 0xec, 0xfd, 0x28]);
        let h = harness(
            ScriptedProvider::new(Strategy::Cctp, 10_000)
                .asynchronous(vec![AttestationStatus::Complete])
                .with_finalize(vec![finalize.clone()]),
            Duration::from_secs(60),
        )
        .await;
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        let before = TaskQueue::new("rebalance", store.clone(), fast_config(2));
        let job = before
            .enqueue(
                EnqueueRequest::with_payload(CHECK_SETTLEMENT_JOB, &payload(&h, Utc::now()))
                    .unwrap()
                    .group(chain_group(8453)),
            )
            .await
            .unwrap();

        // the queue rows outlive the process, the ledger does not
        let fresh_ledger = Arc::new(InMemoryRebalanceLedger::new());
        let monitor = Arc::new(AttestationMonitor::new(
            ProviderRegistry::new().register(h.provider.clone()),
            h.chain.clone(),
            fresh_ledger.clone(),
            Duration::from_secs(60),
        ));
        let restarted = Arc::new(TaskQueue::new("rebalance", store, fast_config(2)));
        let registry = JobRegistry::new().register(monitor);
        let dispatcher = Arc::new(GroupedDispatcher::new(restarted.clone(), Arc::new(registry)));
        let (stop, workers) = spawn_workers(restarted.clone(), dispatcher);

        let done = wait_terminal(&restarted, job.id, Duration::from_secs(5)).await;

        assert_eq!(done.state, JobState::Completed);
        assert_eq!(h.chain.submissions(), vec![(8453, vec![finalize])]);
        assert_eq!(fresh_ledger.status(h.rebalance_id), None);

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dead_immediately() {
        let h = harness(
            ScriptedProvider::new(Strategy::Cctp, 10_000).asynchronous(vec![AttestationStatus::Failed {
                reason: "message replaced".to_string(),
                permanent: true,
            }]),
            Duration::from_secs(60),
        )
        .await;
        let job = enqueue(&h, &payload(&h, Utc::now())).await;
        let (stop, workers) = spawn_workers(h.queue.clone(), dispatcher(&h));

        let dead = wait_terminal(&h.queue, job.id, Duration::from_secs(5)).await;

        assert_eq!(dead.state, JobState::Dead);
        assert_eq!(dead.attempts, 0);
        assert!(dead.last_error.unwrap_or_default().contains("message replaced"));
        let ledger = h.ledger.clone();
        let id = h.rebalance_id;
        eventually(move || ledger.status(id) == Some(RebalanceStatus::Failed), Duration::from_secs(2)).await;

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_uses_attempts() {
        let h = harness(
            ScriptedProvider::new(Strategy::Cctp, 10_000).asynchronous(vec![AttestationStatus::Failed {
                reason: "attestation service error".to_string(),
                permanent: false,
            }]),
            Duration::from_secs(60),
        )
        .await;
        let job = enqueue(&h, &payload(&h, Utc::now())).await;
        let (stop, workers) = spawn_workers(h.queue.clone(), dispatcher(&h));

        let dead = wait_terminal(&h.queue, job.id, Duration::from_secs(5)).await;

        assert_eq!(dead.state, JobState::Dead);
        assert_eq!(dead.attempts, 3);
        assert_eq!(h.provider.settlement_checks.load(Ordering::SeqCst), 3);

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overdue_settlement_times_out() {
        let h = harness(
            ScriptedProvider::new(Strategy::Cctp, 10_000).asynchronous(vec![AttestationStatus::Pending]),
            Duration::from_secs(60),
        )
        .await;
        let job = enqueue(&h, &payload(&h, Utc::now() - chrono::Duration::minutes(5))).await;
        let ctx = JobContext { queue: h.queue.clone() };

        let result = h.monitor.process(&job, &ctx).await;

        assert!(matches!(result, Err(JobError::Unrecoverable(ref msg)) if msg.contains("0xmessage")));
        assert_eq!(h.provider.settlement_checks.load(Ordering::SeqCst), 0);
    }
}
