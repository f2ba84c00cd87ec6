//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Queue throughput, retries and dead letters
//! - Group contention in the dispatcher
//! - Quote fan-out and rebalance outcomes
//! - Chain connection status

use crate::error::{RebalancerError, RebalancerResult};
use crate::queue::QueueSnapshot;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

lazy_static! {
    // Queue metrics
    pub static ref JOBS_ENQUEUED: CounterVec = register_counter_vec!(
        "rebalancer_jobs_enqueued_total",
        "Total jobs enqueued",
        &["queue", "job"]
    ).unwrap();

    pub static ref JOBS_COMPLETED: CounterVec = register_counter_vec!(
        "rebalancer_jobs_completed_total",
        "Total jobs completed",
        &["queue", "job"]
    ).unwrap();

    pub static ref JOBS_RETRIED: CounterVec = register_counter_vec!(
        "rebalancer_jobs_retried_total",
        "Total failed attempts rescheduled with backoff",
        &["queue", "job"]
    ).unwrap();

    pub static ref JOBS_DELAYED: CounterVec = register_counter_vec!(
        "rebalancer_jobs_delayed_total",
        "Total cooperative delays",
        &["queue", "job"]
    ).unwrap();

    pub static ref JOBS_DEAD: CounterVec = register_counter_vec!(
        "rebalancer_jobs_dead_total",
        "Total jobs moved to the dead-letter set",
        &["queue", "job"]
    ).unwrap();

    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "rebalancer_job_duration_seconds",
        "Handler execution time per attempt",
        &["queue", "job"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "rebalancer_queue_depth",
        "Jobs per queue and state at the last health check",
        &["queue", "state"]
    ).unwrap();

    pub static ref GROUP_CONTENTION: CounterVec = register_counter_vec!(
        "rebalancer_group_contention_total",
        "Jobs requeued because their group was busy",
        &["queue"]
    ).unwrap();

    pub static ref ACTIVE_GROUPS: GaugeVec = register_gauge_vec!(
        "rebalancer_active_groups",
        "Groups currently holding an execution slot",
        &["queue"]
    ).unwrap();

    // Quote metrics
    pub static ref QUOTES_RECEIVED: CounterVec = register_counter_vec!(
        "rebalancer_quotes_received_total",
        "Routes returned by providers",
        &["strategy"]
    ).unwrap();

    pub static ref QUOTE_FAILURES: CounterVec = register_counter_vec!(
        "rebalancer_quote_failures_total",
        "Provider quote errors, timeouts and malformed routes",
        &["strategy"]
    ).unwrap();

    // Rebalance metrics
    pub static ref TOKEN_DELTA: GaugeVec = register_gauge_vec!(
        "rebalancer_token_delta_from_target",
        "Normalized balance minus target per token",
        &["wallet", "chain_id", "token"]
    ).unwrap();

    pub static ref REBALANCES: CounterVec = register_counter_vec!(
        "rebalancer_rebalances_total",
        "Rebalance outcomes by strategy",
        &["strategy", "outcome"]
    ).unwrap();

    pub static ref SETTLEMENT_LATENCY: HistogramVec = register_histogram_vec!(
        "rebalancer_settlement_latency_seconds",
        "Time from source submission to observed settlement",
        &["strategy"],
        vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "rebalancer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "rebalancer_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "rebalancer_transactions_failed_total",
        "Total transactions failed",
        &["chain_id"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RebalancerResult<()> {
        let app = router();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RebalancerError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RebalancerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn health_handler() -> &'static str {
    "ok"
}

// Helper functions to record metrics

pub fn record_job_enqueued(queue: &str, job: &str) {
    JOBS_ENQUEUED.with_label_values(&[queue, job]).inc();
}

pub fn record_job_completed(queue: &str, job: &str, duration_secs: f64) {
    JOBS_COMPLETED.with_label_values(&[queue, job]).inc();
    JOB_DURATION
        .with_label_values(&[queue, job])
        .observe(duration_secs);
}

pub fn record_job_retried(queue: &str, job: &str) {
    JOBS_RETRIED.with_label_values(&[queue, job]).inc();
}

pub fn record_job_delayed(queue: &str, job: &str) {
    JOBS_DELAYED.with_label_values(&[queue, job]).inc();
}

pub fn record_job_dead(queue: &str, job: &str) {
    JOBS_DEAD.with_label_values(&[queue, job]).inc();
}

pub fn record_queue_depth(queue: &str, snapshot: &QueueSnapshot) {
    for (state, count) in [
        ("ready", snapshot.ready),
        ("deferred", snapshot.deferred),
        ("active", snapshot.active),
        ("completed", snapshot.completed),
        ("dead", snapshot.dead),
    ] {
        QUEUE_DEPTH.with_label_values(&[queue, state]).set(count as f64);
    }
}

pub fn record_group_contention(queue: &str) {
    GROUP_CONTENTION.with_label_values(&[queue]).inc();
}

pub fn record_active_groups(queue: &str, count: usize) {
    ACTIVE_GROUPS.with_label_values(&[queue]).set(count as f64);
}

pub fn record_quote(strategy: &str) {
    QUOTES_RECEIVED.with_label_values(&[strategy]).inc();
}

pub fn record_quote_failure(strategy: &str) {
    QUOTE_FAILURES.with_label_values(&[strategy]).inc();
}

pub fn record_token_delta(wallet: &str, chain_id: u64, token: &str, delta: f64) {
    TOKEN_DELTA
        .with_label_values(&[wallet, &chain_id.to_string(), token])
        .set(delta);
}

pub fn record_rebalance(strategy: &str, outcome: &str) {
    REBALANCES.with_label_values(&[strategy, outcome]).inc();
}

pub fn record_settlement_latency(strategy: &str, latency_secs: f64) {
    SETTLEMENT_LATENCY
        .with_label_values(&[strategy])
        .observe(latency_secs);
}

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_endpoint_renders_registered_families() {
        record_job_enqueued("metrics-test", "sample");

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("rebalancer_jobs_enqueued_total"));
        assert!(body.contains("queue=\"metrics-test\""));
        assert_eq!(health_handler().await, "ok");
    }
}
