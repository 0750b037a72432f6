//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Submissions and failures per signing mode
//! - Nonce-collision retries
//! - Ownership proofs and relay outcomes
//! - Fees and nonces currently in use

use crate::error::{ExecutorError, ExecutorResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::U256;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "essential_executor_transactions_submitted_total",
        "Total transactions submitted",
        &["mode"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "essential_executor_transactions_confirmed_total",
        "Total transactions confirmed onchain",
        &["mode"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "essential_executor_transactions_failed_total",
        "Total executions that ended in a failure",
        &["mode", "stage", "kind"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "essential_executor_submission_latency_seconds",
        "Time from execute() to submission",
        &["mode"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref COLLISION_RETRIES: CounterVec = register_counter_vec!(
        "essential_executor_nonce_collision_retries_total",
        "Retries triggered by nonce collisions",
        &["mode"]
    ).unwrap();

    // Proof and relay metrics
    pub static ref PROOFS_RESOLVED: CounterVec = register_counter_vec!(
        "essential_executor_proofs_resolved_total",
        "Offchain ownership proofs resolved",
        &[]
    ).unwrap();

    pub static ref RELAY_REQUESTS: CounterVec = register_counter_vec!(
        "essential_executor_relay_requests_total",
        "Relay requests by outcome",
        &["outcome"]
    ).unwrap();

    // Fee and nonce gauges
    pub static ref PRIORITY_FEE: GaugeVec = register_gauge_vec!(
        "essential_executor_priority_fee_gwei",
        "Priority fee applied to the latest native transaction",
        &[]
    ).unwrap();

    pub static ref NEXT_NONCE: GaugeVec = register_gauge_vec!(
        "essential_executor_next_nonce",
        "Next nonce per tracker",
        &["tracker"]
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

    pub async fn run(&self) -> ExecutorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ExecutorError::Config(format!("Failed to bind metrics server on {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ExecutorError::Network(format!("Metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_tx_submitted(mode: &str) {
    TX_SUBMITTED.with_label_values(&[mode]).inc();
}

pub fn record_tx_confirmed(mode: &str) {
    TX_CONFIRMED.with_label_values(&[mode]).inc();
}

pub fn record_tx_failed(mode: &str, stage: &str, kind: &str) {
    TX_FAILED.with_label_values(&[mode, stage, kind]).inc();
}

pub fn record_tx_latency(mode: &str, latency_secs: f64) {
    TX_LATENCY.with_label_values(&[mode]).observe(latency_secs);
}

pub fn record_collision_retry(mode: &str) {
    COLLISION_RETRIES.with_label_values(&[mode]).inc();
}

pub fn record_proof_resolved() {
    PROOFS_RESOLVED.with_label_values(&[]).inc();
}

pub fn record_relay(outcome: &str) {
    RELAY_REQUESTS.with_label_values(&[outcome]).inc();
}

pub fn record_priority_fee(wei: &U256) {
    let gwei = ethers::utils::format_units(*wei, "gwei")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    PRIORITY_FEE.with_label_values(&[]).set(gwei);
}

pub fn record_next_nonce(tracker: &str, next: u64) {
    NEXT_NONCE.with_label_values(&[tracker]).set(next as f64);
}
