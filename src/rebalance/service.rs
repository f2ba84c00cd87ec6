//! Balance checks: the entry point of a rebalance cycle

use super::analyzer::WalletAnalysis;
use super::ledger::RebalanceLedger;
use super::planner::RebalancePlanner;
use super::types::{u256_to_f64, RebalanceRequest, TokenPosition, BASE_DECIMALS};
use super::{chain_group, CHECK_BALANCES_JOB, REBALANCE_JOB};
use crate::chain::BalanceReader;
use crate::config::TokenConfig;
use crate::error::{JobError, RebalancerResult};
use crate::jobs::{GroupedDispatcher, JobContext, JobManager};
use crate::metrics;
use crate::queue::{EnqueueRequest, Job, JobHandle, TaskQueue};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A token kept within bounds, thresholds in its own decimals
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedToken {
    pub chain_id: u64,
    pub address: Address,
    pub decimals: u8,
    pub symbol: Option<String>,
    pub min_balance: U256,
    pub target_balance: U256,
}

impl TrackedToken {
    pub fn from_config(config: &TokenConfig) -> RebalancerResult<Self> {
        let (min_balance, target_balance) = config.thresholds()?;
        Ok(Self {
            chain_id: config.chain_id,
            address: config.address()?,
            decimals: config.decimals,
            symbol: config.symbol.clone(),
            min_balance,
            target_balance,
        })
    }

    fn label(&self) -> String {
        self.symbol.clone().unwrap_or_else(|| format!("{:?}", self.address))
    }

    fn position(&self, balance: U256) -> TokenPosition {
        TokenPosition {
            chain_id: self.chain_id,
            token_address: self.address,
            current_balance: balance,
            min_balance: self.min_balance,
            target_balance: self.target_balance,
            decimals: self.decimals,
        }
    }
}

/// Outcome of one balance check
#[derive(Debug, Clone)]
pub struct RebalanceCheck {
    pub analysis: WalletAnalysis,
    pub requests: Vec<RebalanceRequest>,
    pub jobs: Vec<JobHandle>,
}

pub struct RebalanceService {
    balances: Arc<dyn BalanceReader>,
    tokens: Vec<TrackedToken>,
    planner: RebalancePlanner,
    ledger: Arc<dyn RebalanceLedger>,
    dispatcher: Arc<GroupedDispatcher>,
    /// When off, checks only analyze and report
    enabled: bool,
}

impl RebalanceService {
    pub fn new(
        balances: Arc<dyn BalanceReader>,
        tokens: Vec<TrackedToken>,
        planner: RebalancePlanner,
        ledger: Arc<dyn RebalanceLedger>,
        dispatcher: Arc<GroupedDispatcher>,
        enabled: bool,
    ) -> Self {
        Self {
            balances,
            tokens,
            planner,
            ledger,
            dispatcher,
            enabled,
        }
    }

    /// Fresh balances for every tracked token, net of rebalances still in
    /// flight. Tokens whose balance cannot be read are left out of this cycle.
    pub async fn analyze_wallet(&self, wallet: Address) -> RebalancerResult<WalletAnalysis> {
        let reads = self.tokens.iter().map(|token| async move {
            let balance = self.balances.get_balance(token.chain_id, token.address, wallet).await;
            (token, balance)
        });

        let mut positions = Vec::with_capacity(self.tokens.len());
        for (token, balance) in join_all(reads).await {
            match balance {
                Ok(balance) => positions.push(token.position(balance)),
                Err(e) => warn!(
                    "Skipping {} on chain {} for {:?}: {}",
                    token.label(),
                    token.chain_id,
                    wallet,
                    e
                ),
            }
        }

        let reservations = self.ledger.reservations(wallet).await?;
        if !reservations.is_empty() {
            positions = positions.into_iter().map(|p| reservations.apply(p)).collect();
        }

        let analysis = WalletAnalysis::new(wallet, positions);
        let wallet_label = format!("{:?}", wallet);
        for item in &analysis.items {
            let token = self
                .tokens
                .iter()
                .find(|t| t.chain_id == item.position.chain_id && t.address == item.position.token_address)
                .map(TrackedToken::label)
                .unwrap_or_default();
            let magnitude = u256_to_f64(item.delta_from_target.unsigned_abs()) / 10f64.powi(BASE_DECIMALS as i32);
            let delta = if item.delta_from_target.is_negative() {
                -magnitude
            } else {
                magnitude
            };
            metrics::record_token_delta(&wallet_label, item.position.chain_id, &token, delta);
            debug!(
                "{} on chain {}: {} ({:+.4} from target)",
                token, item.position.chain_id, item.status, delta
            );
        }
        Ok(analysis)
    }

    /// Analyze, plan, and enqueue one `rebalance` job per planned step
    pub async fn run_rebalance_check(&self, wallet: Address) -> RebalancerResult<RebalanceCheck> {
        let analysis = self.analyze_wallet(wallet).await?;
        let deficits = analysis.deficits().len();
        let surpluses = analysis.surpluses().len();
        info!(
            "Balance check for {:?}: {} deficit(s), {} surplus(es), {} in range",
            wallet,
            deficits,
            surpluses,
            analysis.in_range().len()
        );

        if !self.enabled || deficits == 0 || surpluses == 0 {
            return Ok(RebalanceCheck {
                analysis,
                requests: Vec::new(),
                jobs: Vec::new(),
            });
        }

        let requests = self.planner.plan(&analysis).await;
        let mut jobs = Vec::with_capacity(requests.len());
        for request in &requests {
            self.ledger.record_pending(request).await?;
            let job = self
                .dispatcher
                .enqueue(
                    EnqueueRequest::with_payload(REBALANCE_JOB, request)?,
                    chain_group(request.source_chain_id),
                )
                .await?;
            debug!("Rebalance {} queued as job {}", request.id, job.id);
            jobs.push(job);
        }

        if !requests.is_empty() {
            info!("Queued {} rebalance step(s) for {:?}", requests.len(), wallet);
        }
        Ok(RebalanceCheck {
            analysis,
            requests,
            jobs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckBalancesPayload {
    pub wallet: Address,
}

/// Runs the recurring `check-balances` job of each wallet
pub struct CheckBalancesJobManager {
    service: Arc<RebalanceService>,
}

impl CheckBalancesJobManager {
    pub fn new(service: Arc<RebalanceService>) -> Self {
        Self { service }
    }

    pub fn schedule_name(wallet: Address) -> String {
        format!("{}-{:?}", CHECK_BALANCES_JOB, wallet)
    }

    /// (Re)register the wallet's recurring check; the first run is immediate
    pub async fn schedule(queue: &TaskQueue, wallet: Address, interval: Duration) -> RebalancerResult<JobHandle> {
        let request = EnqueueRequest::with_payload(CHECK_BALANCES_JOB, &CheckBalancesPayload { wallet })?
            .group(format!("wallet:{:?}", wallet));
        queue
            .enqueue_recurring(&Self::schedule_name(wallet), interval, request)
            .await
    }
}

#[async_trait]
impl JobManager for CheckBalancesJobManager {
    fn name(&self) -> &'static str {
        "balance-checker"
    }

    fn claims(&self, job: &Job) -> bool {
        job.name == CHECK_BALANCES_JOB
    }

    async fn process(&self, job: &Job, _ctx: &JobContext) -> Result<(), JobError> {
        let payload: CheckBalancesPayload = job.payload_as()?;
        self.service.run_rebalance_check(payload.wallet).await?;
        Ok(())
    }
}
