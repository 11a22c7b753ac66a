//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - RPC endpoint failures and failover
//! - Transaction submission and completion
//! - Poller activity
//! - Fee quotes

use crate::error::{WalletError, WalletResult};
use crate::ledger::TxStatus;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // RPC metrics
    pub static ref RPC_FAILURES: CounterVec = register_counter_vec!(
        "tesseract_wallet_rpc_failures_total",
        "RPC requests that exhausted every endpoint",
        &["chain"]
    ).unwrap();

    pub static ref ENDPOINT_FAILURES: CounterVec = register_counter_vec!(
        "tesseract_wallet_endpoint_failures_total",
        "Transport failures per endpoint",
        &["chain", "url"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "tesseract_wallet_transactions_submitted_total",
        "Transactions recorded in the pending ledger",
        &["chain"]
    ).unwrap();

    pub static ref TX_COMPLETED: CounterVec = register_counter_vec!(
        "tesseract_wallet_transactions_completed_total",
        "Transactions that reached a terminal status",
        &["chain", "status"]
    ).unwrap();

    pub static ref TX_PENDING: Gauge = register_gauge!(
        "tesseract_wallet_transactions_pending",
        "Pending ledger entries across all accounts"
    ).unwrap();

    pub static ref TX_REPLACEMENTS: CounterVec = register_counter_vec!(
        "tesseract_wallet_replacements_total",
        "Speed-up and cancel transactions broadcast",
        &["chain", "kind"]
    ).unwrap();

    // Poller metrics
    pub static ref POLL_TICKS: Counter = register_counter!(
        "tesseract_wallet_poll_ticks_total",
        "Poller reconciliation passes"
    ).unwrap();

    // Fee metrics
    pub static ref FEE_QUOTE_GWEI: HistogramVec = register_histogram_vec!(
        "tesseract_wallet_fee_quote_gwei",
        "Quoted max fee per gas",
        &["chain"],
        vec![0.1, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
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

    pub async fn run(&self) -> WalletResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| WalletError::Config(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| WalletError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

pub async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn render() -> WalletResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| WalletError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| WalletError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_rpc_failure(chain_key: &str) {
    RPC_FAILURES.with_label_values(&[chain_key]).inc();
}

pub fn record_endpoint_failure(chain_key: &str, url: &str) {
    ENDPOINT_FAILURES.with_label_values(&[chain_key, url]).inc();
}

pub fn record_tx_submitted(chain_key: &str) {
    TX_SUBMITTED.with_label_values(&[chain_key]).inc();
}

pub fn record_tx_completed(chain_key: &str, status: TxStatus, count: usize) {
    if count > 0 {
        TX_COMPLETED
            .with_label_values(&[chain_key, status.as_str()])
            .inc_by(count as f64);
    }
}

pub fn record_replacement(chain_key: &str, kind: &str) {
    TX_REPLACEMENTS.with_label_values(&[chain_key, kind]).inc();
}

pub fn set_pending_transactions(count: usize) {
    TX_PENDING.set(count as f64);
}

pub fn record_poll_tick() {
    POLL_TICKS.inc();
}

pub fn record_fee_quote(chain_key: &str, max_fee_gwei: f64) {
    FEE_QUOTE_GWEI
        .with_label_values(&[chain_key])
        .observe(max_fee_gwei);
}
