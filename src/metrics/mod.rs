//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce session lifecycle and lock contention
//! - Reconciliation outcomes
//! - Transaction submission, confirmation and escalation
//! - Gas pricing decisions
//!
//! The host process serves `gather()` wherever it exposes metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // Session metrics
    pub static ref SESSIONS_STARTED: CounterVec = register_counter_vec!(
        "tx_coordinator_sessions_started_total",
        "Total nonce sessions started",
        &["chain_id"]
    ).unwrap();

    pub static ref LOCK_CONTENTION: CounterVec = register_counter_vec!(
        "tx_coordinator_lock_contention_total",
        "Lock acquisition attempts that found the wallet busy",
        &["chain_id"]
    ).unwrap();

    pub static ref LOCK_FAILURES: CounterVec = register_counter_vec!(
        "tx_coordinator_lock_failures_total",
        "Sessions that gave up waiting for the wallet lock",
        &["chain_id"]
    ).unwrap();

    pub static ref STALE_LOCKS: CounterVec = register_counter_vec!(
        "tx_coordinator_stale_locks_total",
        "Lock metadata rows cleared as stale",
        &["chain_id"]
    ).unwrap();

    pub static ref SESSION_DURATION: HistogramVec = register_histogram_vec!(
        "tx_coordinator_session_duration_seconds",
        "How long sessions hold the wallet lock",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    // Reconciliation metrics
    pub static ref RECONCILED: CounterVec = register_counter_vec!(
        "tx_coordinator_reconciled_total",
        "Pending records reconciled against chain state",
        &["chain_id", "status"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "tx_coordinator_transactions_submitted_total",
        "Total transactions submitted, replacements included",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "tx_coordinator_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "tx_coordinator_transactions_failed_total",
        "Total transactions failed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_ESCALATIONS: CounterVec = register_counter_vec!(
        "tx_coordinator_escalations_total",
        "Replacement transactions sent for stuck nonces",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_STUCK: CounterVec = register_counter_vec!(
        "tx_coordinator_stuck_transactions_total",
        "Transactions abandoned after exhausting escalation",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "tx_coordinator_confirmation_latency_seconds",
        "Time from first submission to confirmation",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Gas metrics
    pub static ref FEE_PATH: CounterVec = register_counter_vec!(
        "tx_coordinator_fee_path_total",
        "Pricing decisions by fee path",
        &["chain_id", "path"]
    ).unwrap();

    pub static ref FEE_VOLATILITY: GaugeVec = register_gauge_vec!(
        "tx_coordinator_base_fee_cv",
        "Last observed coefficient of variation of base fees",
        &["chain_id"]
    ).unwrap();
}

/// Render all registered metrics in the text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_session_started(chain_id: u64) {
    SESSIONS_STARTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_lock_contention(chain_id: u64) {
    LOCK_CONTENTION
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_lock_failure(chain_id: u64) {
    LOCK_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_stale_lock(chain_id: u64) {
    STALE_LOCKS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_session_duration(chain_id: u64, secs: f64) {
    SESSION_DURATION
        .with_label_values(&[&chain_id.to_string()])
        .observe(secs);
}

pub fn record_reconciled(chain_id: u64, status: &str) {
    RECONCILED
        .with_label_values(&[&chain_id.to_string(), status])
        .inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_escalation(chain_id: u64) {
    TX_ESCALATIONS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_stuck(chain_id: u64) {
    TX_STUCK
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_latency(chain_id: u64, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_fee_path(chain_id: u64, path: &str) {
    FEE_PATH
        .with_label_values(&[&chain_id.to_string(), path])
        .inc();
}

pub fn record_volatility(chain_id: u64, cv: f64) {
    FEE_VOLATILITY
        .with_label_values(&[&chain_id.to_string()])
        .set(cv);
}
