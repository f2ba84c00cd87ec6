//! Solver Rebalancer - keeps solver wallets funded across chains
//!
//! Runs two job queues: `balance_checks` holds one recurring check per
//! wallet, `rebalance` executes the planned route steps and polls bridge
//! settlement, serialized per chain.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use solver_rebalancer::chain::{BalanceReader, ChainManager, EvmBalanceReader, TransactionSigner};
use solver_rebalancer::config::Settings;
use solver_rebalancer::jobs::{GroupedDispatcher, JobRegistry};
use solver_rebalancer::metrics::{self, MetricsServer};
use solver_rebalancer::providers::{cctp::CctpProvider, ProviderRegistry};
use solver_rebalancer::queue::{MemoryQueueStore, PgQueueStore, QueueStore, TaskQueue};
use solver_rebalancer::rebalance::{
    AttestationMonitor, CheckBalancesJobManager, InMemoryRebalanceLedger, PgRebalanceLedger, QuoteAggregator,
    RebalanceExecutor, RebalanceJobManager, RebalanceLedger, RebalancePlanner, RebalanceService, SettlementPolicy,
    TrackedToken,
};
use solver_rebalancer::tx::{EvmTransactionSigner, WalletGatedSigner};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Solver Rebalancer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains, {} wallets, {} tokens",
        settings.enabled_chains().len(),
        settings.wallets.len(),
        settings.tokens.len()
    );

    // Queue storage: Postgres when configured, otherwise process memory
    let (store, database): (Arc<dyn QueueStore>, Option<Arc<PgQueueStore>>) = match &settings.database {
        Some(db) => {
            let pg = Arc::new(PgQueueStore::new(db).await?);
            pg.run_migrations().await?;
            info!("Database queue store ready");
            let store: Arc<dyn QueueStore> = pg.clone();
            (store, Some(pg))
        }
        None => {
            warn!("No database configured, queued jobs will not survive a restart");
            let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
            (store, None)
        }
    };

    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!("Chain connections initialized");

    let balances: Arc<dyn BalanceReader> = Arc::new(EvmBalanceReader::new(chain_manager.clone()));
    let evm_signer = EvmTransactionSigner::new(chain_manager.clone(), settings.signer.clone())?;
    info!("Signing as {:?}", evm_signer.wallet_address());
    let signer: Arc<dyn TransactionSigner> = Arc::new(WalletGatedSigner::new(evm_signer));

    let mut providers = ProviderRegistry::new();
    if let Some(cctp) = &settings.cctp {
        providers = providers.register(Arc::new(CctpProvider::new(cctp)?));
    }
    if providers.is_empty() {
        warn!("No rebalance providers configured, checks will only report balances");
    } else {
        info!("Rebalance providers: {:?}", providers.strategies());
    }

    // The ledger lives wherever the queue does, so in-flight work survives together
    let ledger: Arc<dyn RebalanceLedger> = match &database {
        Some(pg) => {
            let ledger = PgRebalanceLedger::new(pg.pool());
            ledger.run_migrations().await?;
            Arc::new(ledger)
        }
        None => Arc::new(InMemoryRebalanceLedger::new()),
    };
    let rebalancer = &settings.rebalancer;

    // Rebalance queue: route steps and settlement checks
    let rebalance_queue = Arc::new(TaskQueue::new(
        "rebalance",
        store.clone(),
        settings.queues.rebalance.clone(),
    ));
    let executor = Arc::new(RebalanceExecutor::new(
        providers.clone(),
        balances.clone(),
        signer.clone(),
        ledger.clone(),
        rebalance_queue.clone(),
        SettlementPolicy::from(rebalancer),
    ));
    let rebalance_registry = JobRegistry::new()
        .register(Arc::new(RebalanceJobManager::new(executor, ledger.clone())))
        .register(Arc::new(AttestationMonitor::new(
            providers.clone(),
            signer.clone(),
            ledger.clone(),
            Duration::from_secs(rebalancer.settlement_timeout_secs),
        )));
    let rebalance_dispatcher = Arc::new(GroupedDispatcher::new(
        rebalance_queue.clone(),
        Arc::new(rebalance_registry),
    ));

    // Balance check queue: one recurring job per wallet
    let tokens = settings
        .tokens
        .iter()
        .map(TrackedToken::from_config)
        .collect::<Result<Vec<_>, _>>()?;
    let planner = RebalancePlanner::new(
        Arc::new(QuoteAggregator::new(providers, rebalancer)),
        rebalancer.min_trade_base()?,
    );
    let service = Arc::new(RebalanceService::new(
        balances,
        tokens,
        planner,
        ledger,
        rebalance_dispatcher.clone(),
        rebalancer.enabled,
    ));
    let checks_queue = Arc::new(TaskQueue::new(
        "balance_checks",
        store,
        settings.queues.balance_checks.clone(),
    ));
    let checks_registry = JobRegistry::new().register(Arc::new(CheckBalancesJobManager::new(service)));
    let checks_dispatcher = Arc::new(GroupedDispatcher::new(checks_queue.clone(), Arc::new(checks_registry)));

    for wallet in &settings.wallets {
        let address = wallet.address()?;
        CheckBalancesJobManager::schedule(&checks_queue, address, rebalancer.check_interval()).await?;
        info!(
            "Checking {:?}{} every {:?}",
            address,
            wallet.label.as_deref().map(|l| format!(" ({})", l)).unwrap_or_default(),
            rebalancer.check_interval()
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_handle = settings.metrics.enabled.then(|| {
        let server = MetricsServer::new(settings.metrics.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    let worker_handles: Vec<_> = [rebalance_dispatcher, checks_dispatcher]
        .into_iter()
        .map(|dispatcher| {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let queue = dispatcher.queue().name().to_string();
                if let Err(e) = dispatcher.run(shutdown).await {
                    error!("Workers for {} stopped: {}", queue, e);
                }
            })
        })
        .collect();

    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let queues = [rebalance_queue.clone(), checks_queue.clone()];
        let interval = settings.service.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                for (chain_id, healthy) in chain_manager.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }

                if let Some(db) = &database {
                    if let Err(e) = db.health_check().await {
                        warn!("Database health check failed: {}", e);
                    }
                }

                for queue in &queues {
                    match queue.snapshot().await {
                        Ok(s) => {
                            metrics::record_queue_depth(queue.name(), &s);
                            if s.dead > 0 {
                                warn!("Queue {} has {} dead jobs", queue.name(), s.dead);
                            }
                        }
                        Err(e) => warn!("Queue {} snapshot failed: {}", queue.name(), e),
                    }
                }
            }
        }
    });

    info!("Solver Rebalancer is running as {}", settings.service.instance_id);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, draining in-flight jobs...");
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        if let Err(e) = handle.await {
            error!("Worker task panicked: {}", e);
        }
    }

    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Solver Rebalancer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,solver_rebalancer=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
